//! CLI command implementations.

pub mod inspect;
pub mod read;
pub mod write;

use clap::ValueEnum;
use std::path::Path;
use thiserror::Error;
use versadb_core::{Config, CoreError, Engine, RecordId, Value};

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine reported an error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage could not be read.
    #[error(transparent)]
    Storage(#[from] versadb_storage::StorageError),

    /// Output could not be rendered.
    #[error("failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value argument did not parse as its declared type.
    #[error("cannot parse {input:?} as {expected}")]
    BadValue {
        /// The raw argument.
        input: String,
        /// The type it was declared as.
        expected: &'static str,
    },

    /// Nothing that looks like an engine lives at the path.
    #[error("no engine found at {0}")]
    NoEngine(String),
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// How a value argument is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ValueType {
    /// UTF-8 text, taken as is.
    Text,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// `true` or `false`.
    Bool,
    /// Record identifier.
    Link,
}

impl ValueType {
    /// Parses `input` into a value of this type.
    pub fn parse(self, input: &str) -> Result<Value, CliError> {
        let bad = |expected| CliError::BadValue {
            input: input.to_string(),
            expected,
        };
        match self {
            Self::Text => Ok(Value::from(input)),
            Self::Int => input.parse::<i64>().map(Value::Int).map_err(|_| bad("int")),
            Self::Float => input
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| bad("float")),
            Self::Bool => input.parse::<bool>().map(Value::Bool).map_err(|_| bad("bool")),
            Self::Link => input
                .parse::<u64>()
                .map(|id| Value::Link(RecordId::new(id)))
                .map_err(|_| bad("link")),
        }
    }
}

fn cli_config() -> Config {
    // One-shot commands move writes explicitly; no worker should race them.
    Config::default().background_transport(false).worker_threads(1)
}

/// Opens the engine at `path`, creating it when `create` is set.
pub fn open_engine(path: &Path, create: bool) -> Result<Engine, CliError> {
    if !create && !path.is_dir() {
        return Err(CliError::NoEngine(path.display().to_string()));
    }
    Ok(Engine::open_with_config(
        path,
        cli_config().create_if_missing(create),
    )?)
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

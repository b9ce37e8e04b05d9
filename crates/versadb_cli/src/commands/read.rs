//! Fetch, audit and describe commands.

use super::{open_engine, print_json, CliError, Format};
use serde::Serialize;
use std::path::Path;
use versadb_core::{RecordId, Revision, Value, Version};

#[derive(Debug, Serialize)]
struct FetchOutput<'a> {
    key: &'a str,
    record: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    at: Option<u64>,
    values: Vec<Value>,
}

/// Prints the values of `(key, record)`, now or as of `at`.
pub fn fetch(
    path: &Path,
    key: &str,
    record: u64,
    at: Option<u64>,
    format: Format,
) -> Result<Vec<Value>, CliError> {
    let engine = open_engine(path, false)?;
    let id = RecordId::new(record);
    let values = match at {
        Some(version) => engine.fetch_at(key, id, Version::new(version)),
        None => engine.fetch(key, id),
    };
    engine.shutdown()?;

    match format {
        Format::Json => print_json(&FetchOutput {
            key,
            record,
            at,
            values: values.clone(),
        })?,
        Format::Text => {
            if values.is_empty() {
                println!("(no values)");
            }
            for value in &values {
                println!("{value}");
            }
        }
    }
    Ok(values)
}

/// Prints every revision of `(key, record)`, oldest first.
pub fn audit(path: &Path, key: &str, record: u64, format: Format) -> Result<Vec<Revision>, CliError> {
    let engine = open_engine(path, false)?;
    let history = engine.audit(key, RecordId::new(record));
    engine.shutdown()?;

    match format {
        Format::Json => print_json(&history)?,
        Format::Text => {
            for revision in &history {
                println!("{revision}");
            }
        }
    }
    Ok(history)
}

/// Prints the keys of `record` that hold at least one value.
pub fn describe(path: &Path, record: u64, format: Format) -> Result<Vec<String>, CliError> {
    let engine = open_engine(path, false)?;
    let keys: Vec<String> = engine.describe(RecordId::new(record)).into_iter().collect();
    engine.shutdown()?;

    match format {
        Format::Json => print_json(&keys)?,
        Format::Text => {
            for key in &keys {
                println!("{key}");
            }
        }
    }
    Ok(keys)
}

//! VersaDB CLI
//!
//! Command-line tools for VersaDB engine directories.
//!
//! # Commands
//!
//! - `add` / `remove` - Apply a single write
//! - `fetch` - Show current (or past) values of a field
//! - `audit` - Show the revision history of a field
//! - `describe` - List the keys of a record that hold values
//! - `transport` - Move every buffered write into the database
//! - `inspect` - Display log statistics and leftover backups
//! - `dump-buffer` - Dump writes waiting in the buffer

mod commands;

use clap::{Parser, Subcommand};
use commands::{Format, ValueType};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// VersaDB command-line tools.
#[derive(Parser)]
#[command(name = "versadb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a value to a field
    Add {
        /// Field key
        key: String,
        /// Value, parsed according to --type
        value: String,
        /// Record identifier
        record: u64,
        /// How to parse the value
        #[arg(short = 't', long = "type", value_enum, default_value = "text")]
        value_type: ValueType,
    },

    /// Remove a value from a field
    Remove {
        /// Field key
        key: String,
        /// Value, parsed according to --type
        value: String,
        /// Record identifier
        record: u64,
        /// How to parse the value
        #[arg(short = 't', long = "type", value_enum, default_value = "text")]
        value_type: ValueType,
    },

    /// Show the values of a field
    Fetch {
        /// Field key
        key: String,
        /// Record identifier
        record: u64,
        /// Show values as of this version instead of now
        #[arg(short, long)]
        at: Option<u64>,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show the revision history of a field
    Audit {
        /// Field key
        key: String,
        /// Record identifier
        record: u64,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List the keys of a record that currently hold values
    Describe {
        /// Record identifier
        record: u64,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Move every buffered write into the database
    Transport,

    /// Display log statistics and leftover transaction backups
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Dump writes waiting in the buffer
    DumpBuffer {
        /// Maximum number of writes to dump
        #[arg(short, long)]
        limit: Option<usize>,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = || cli.path.clone().ok_or("Engine path required (--path)");

    match cli.command {
        Commands::Add {
            key,
            value,
            record,
            value_type,
        } => {
            let value = value_type.parse(&value)?;
            commands::write::run(&path()?, commands::write::Op::Add, &key, value, record)?;
        }
        Commands::Remove {
            key,
            value,
            record,
            value_type,
        } => {
            let value = value_type.parse(&value)?;
            commands::write::run(&path()?, commands::write::Op::Remove, &key, value, record)?;
        }
        Commands::Fetch {
            key,
            record,
            at,
            format,
        } => {
            commands::read::fetch(&path()?, &key, record, at, format)?;
        }
        Commands::Audit {
            key,
            record,
            format,
        } => {
            commands::read::audit(&path()?, &key, record, format)?;
        }
        Commands::Describe { record, format } => {
            commands::read::describe(&path()?, record, format)?;
        }
        Commands::Transport => {
            commands::write::transport(&path()?)?;
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&path()?, format)?;
        }
        Commands::DumpBuffer { limit, format } => {
            commands::inspect::dump_buffer(&path()?, limit, format)?;
        }
        Commands::Version => {
            println!("VersaDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("VersaDB Core v{}", versadb_core::VERSION);
        }
    }

    Ok(())
}

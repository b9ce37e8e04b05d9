//! Add, remove and transport commands.

use super::{open_engine, CliError};
use std::path::Path;
use versadb_core::{RecordId, Value};

/// Which write to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Associate the value.
    Add,
    /// Dissociate the value.
    Remove,
}

/// Applies one write and reports whether it changed anything.
pub fn run(path: &Path, op: Op, key: &str, value: Value, record: u64) -> Result<bool, CliError> {
    let engine = open_engine(path, op == Op::Add)?;
    let record = RecordId::new(record);
    let shown = value.to_string();
    let changed = match op {
        Op::Add => engine.add(key, value, record)?,
        Op::Remove => engine.remove(key, value, record)?,
    };
    engine.shutdown()?;

    match (op, changed) {
        (Op::Add, true) => println!("added {shown} to {key} in {record}"),
        (Op::Add, false) => println!("{shown} already in {key} in {record}"),
        (Op::Remove, true) => println!("removed {shown} from {key} in {record}"),
        (Op::Remove, false) => println!("{shown} not in {key} in {record}"),
    }
    Ok(changed)
}

/// Moves every buffered write into the database.
pub fn transport(path: &Path) -> Result<usize, CliError> {
    let engine = open_engine(path, false)?;
    let moved = engine.transport_all()?;
    engine.shutdown()?;
    println!("transported {moved} writes");
    Ok(moved)
}

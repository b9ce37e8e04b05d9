//! What a lock covers and how.

use crate::types::RecordId;
use std::fmt;

/// The granularity of a lock.
///
/// Scopes form a hierarchy over fields: a record scope covers every field
/// of that record, a key scope covers that key in every record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Every field of one record.
    Record(RecordId),
    /// One key across all records.
    Key(String),
    /// One `(key, record)` field.
    Field(String, RecordId),
}

impl LockScope {
    /// Whether two scopes cover at least one common field.
    ///
    /// A record scope and a key scope always do: the key in that record.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Record(a), Self::Record(b)) => a == b,
            (Self::Key(a), Self::Key(b)) => a == b,
            (Self::Record(_), Self::Key(_)) | (Self::Key(_), Self::Record(_)) => true,
            (Self::Record(r), Self::Field(_, fr)) | (Self::Field(_, fr), Self::Record(r)) => r == fr,
            (Self::Key(k), Self::Field(fk, _)) | (Self::Field(fk, _), Self::Key(k)) => k == fk,
            (Self::Field(ka, ra), Self::Field(kb, rb)) => ra == rb && ka == kb,
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(record) => write!(f, "record {record}"),
            Self::Key(key) => write!(f, "key {key}"),
            Self::Field(key, record) => write!(f, "{key} in {record}"),
        }
    }
}

/// How a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Readers; compatible with other shared holders.
    Shared,
    /// A single writer; excludes every other owner on intersecting scopes.
    Isolated,
}

impl LockMode {
    /// Whether two modes can be held by different owners on intersecting scopes.
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// Identity on whose behalf locks are held.
///
/// Locks never conflict with other locks of the same owner, so a
/// transaction can read a record and then write a field inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(pub(crate) u64);

impl LockOwner {
    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

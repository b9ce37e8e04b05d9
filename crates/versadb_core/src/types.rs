//! Core identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a record.
///
/// Record identifiers are assigned by the caller. The engine never deletes
/// one; it only adds and removes key/value associations inside it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Creates a record identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The instant a value became true, in microseconds since the Unix epoch.
///
/// Versions handed out by one [`crate::Clock`] are strictly increasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// Marker for a write that has not been stamped yet.
    pub const UNSTAMPED: Self = Self(0);

    /// Creates a version from raw microseconds.
    #[must_use]
    pub const fn new(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the raw microseconds.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns whether this is a real stamp.
    #[must_use]
    pub const fn is_stamped(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a transaction, unique within one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a transaction identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_round_trips_raw_value() {
        let record = RecordId::from(42);
        assert_eq!(record.as_u64(), 42);
        assert_eq!(format!("{record}"), "42");
    }

    #[test]
    fn unstamped_version_is_zero() {
        assert!(!Version::UNSTAMPED.is_stamped());
        assert!(Version::new(1).is_stamped());
        assert!(Version::new(1) < Version::new(2));
    }

    #[test]
    fn transaction_id_display() {
        assert_eq!(format!("{}", TransactionId::new(7)), "txn:7");
    }
}

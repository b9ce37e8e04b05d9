//! Writes: the unit of change that flows through the pipeline.

use crate::types::{RecordId, Version};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// What a [`Write`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Associate the value with the key in the record.
    Add,
    /// Dissociate the value from the key in the record.
    Remove,
    /// A write that only exists in memory, e.g. a comparison key. It must
    /// never reach the buffer or the database.
    NotForStorage,
}

impl WriteKind {
    /// Returns the storable action, or `None` for [`WriteKind::NotForStorage`].
    #[must_use]
    pub const fn action(self) -> Option<Action> {
        match self {
            Self::Add => Some(Action::Add),
            Self::Remove => Some(Action::Remove),
            Self::NotForStorage => None,
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
            Self::NotForStorage => "COMPARE",
        })
    }
}

/// A storable action, as recorded in a field's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// The value became associated.
    Add,
    /// The value stopped being associated.
    Remove,
}

impl From<Action> for WriteKind {
    fn from(action: Action) -> Self {
        match action {
            Action::Add => Self::Add,
            Action::Remove => Self::Remove,
        }
    }
}

/// One entry of a field's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Whether the value was added or removed.
    pub action: Action,
    /// The value concerned.
    pub value: Value,
    /// When it happened.
    pub version: Version,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} AT {}", WriteKind::from(self.action), self.value, self.version)
    }
}

/// An immutable request to change one `(key, record)` field.
///
/// Two writes are equal when they name the same key, value and record. Kind
/// and version are ignored, so an `Add` and a `Remove` of the same value
/// compare equal; that is what lets the pipeline recognize a write it has
/// already seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Write {
    key: String,
    value: Value,
    record: RecordId,
    kind: WriteKind,
    version: Version,
}

impl Write {
    fn new(kind: WriteKind, key: impl Into<String>, value: Value, record: RecordId) -> Self {
        Self {
            key: key.into(),
            value,
            record,
            kind,
            version: Version::UNSTAMPED,
        }
    }

    /// Creates an unstamped `Add`.
    pub fn add(key: impl Into<String>, value: impl Into<Value>, record: RecordId) -> Self {
        Self::new(WriteKind::Add, key, value.into(), record)
    }

    /// Creates an unstamped `Remove`.
    pub fn remove(key: impl Into<String>, value: impl Into<Value>, record: RecordId) -> Self {
        Self::new(WriteKind::Remove, key, value.into(), record)
    }

    /// Creates a write that must never be stored.
    pub fn not_for_storage(key: impl Into<String>, value: impl Into<Value>, record: RecordId) -> Self {
        Self::new(WriteKind::NotForStorage, key, value.into(), record)
    }

    /// Returns a copy carrying `version`.
    #[must_use]
    pub fn stamped(&self, version: Version) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// The key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The record.
    #[must_use]
    pub fn record(&self) -> RecordId {
        self.record
    }

    /// The kind.
    #[must_use]
    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    /// The version, [`Version::UNSTAMPED`] until stamped.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether this write is allowed into a storage tier.
    #[must_use]
    pub fn is_storable(&self) -> bool {
        self.kind.action().is_some()
    }

    /// Whether this write names `(key, value, record)`.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value, record: RecordId) -> bool {
        self.record == record && self.key == key && &self.value == value
    }

    /// Converts a stored write into the revision it represents.
    #[must_use]
    pub fn to_revision(&self) -> Option<Revision> {
        self.kind.action().map(|action| Revision {
            action,
            value: self.value.clone(),
            version: self.version,
        })
    }
}

impl PartialEq for Write {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.key, &other.value, other.record)
    }
}

impl Eq for Write {}

impl Hash for Write {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.value.hash(state);
        self.record.hash(state);
    }
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} AS {} IN {}",
            self.kind, self.key, self.value, self.record
        )?;
        if self.version.is_stamped() {
            write!(f, " AT {}", self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_kind_and_version() {
        let add = Write::add("name", "Bob", RecordId::new(42));
        let remove = Write::remove("name", "Bob", RecordId::new(42)).stamped(Version::new(9));
        assert_eq!(add, remove);

        let mut set = HashSet::new();
        set.insert(add.clone());
        assert!(!set.insert(remove));
        assert!(set.insert(Write::add("name", "Alice", RecordId::new(42))));
        assert!(set.insert(Write::add("name", "Bob", RecordId::new(43))));
    }

    #[test]
    fn constructors_are_unstamped() {
        let write = Write::add("age", 30, RecordId::new(1));
        assert_eq!(write.version(), Version::UNSTAMPED);
        assert_eq!(write.kind(), WriteKind::Add);

        let stamped = write.stamped(Version::new(77));
        assert_eq!(stamped.version(), Version::new(77));
        assert_eq!(write.version(), Version::UNSTAMPED);
    }

    #[test]
    fn not_for_storage_has_no_action() {
        let transient = Write::not_for_storage("name", "Bob", RecordId::new(42));
        assert!(!transient.is_storable());
        assert!(transient.to_revision().is_none());
        assert!(Write::remove("name", "Bob", RecordId::new(42)).is_storable());
    }

    #[test]
    fn display_reads_like_a_statement() {
        let write = Write::add("name", "Bob", RecordId::new(42));
        assert_eq!(write.to_string(), "ADD name AS Bob IN 42");
        assert_eq!(
            write.stamped(Version::new(5)).to_string(),
            "ADD name AS Bob IN 42 AT v5"
        );
    }

    #[test]
    fn revision_from_stamped_write() {
        let write = Write::remove("name", "Bob", RecordId::new(42)).stamped(Version::new(3));
        let revision = write.to_revision().unwrap();
        assert_eq!(revision.action, Action::Remove);
        assert_eq!(revision.version, Version::new(3));
        assert_eq!(revision.to_string(), "REMOVE Bob AT v3");
    }
}

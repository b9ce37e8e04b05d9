//! Property-based test generators using proptest.
//!
//! Keys and records are drawn from small pools so that generated sequences
//! collide often: repeated adds, removes of absent values and add/remove
//! toggles are what the pipeline has to get right.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use versadb_core::{Action, RecordId, Value, Write};

/// Strategy for generating keys from a small pool.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["name", "age", "email", "tag", "friend"]).prop_map(str::to_string)
}

/// Strategy for generating free-form keys.
pub fn any_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating record identifiers from a small pool.
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    (0u64..8).prop_map(RecordId::new)
}

/// Strategy for generating values of every type.
///
/// Floats are kept finite so that generated values compare equal to
/// themselves after a round trip through storage.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-5i64..5).prop_map(Value::Int),
        (-100.0f64..100.0).prop_map(Value::Float),
        prop::sample::select(vec!["Bob", "Ann", "Eve"]).prop_map(Value::from),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        (0u64..4).prop_map(|id| Value::Link(RecordId::new(id))),
    ]
}

/// One generated write operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    /// Whether to add or remove.
    pub action: Action,
    /// The key.
    pub key: String,
    /// The value.
    pub value: Value,
    /// The record.
    pub record: RecordId,
}

impl WriteOp {
    /// The write this operation stands for.
    #[must_use]
    pub fn to_write(&self) -> Write {
        match self.action {
            Action::Add => Write::add(self.key.as_str(), self.value.clone(), self.record),
            Action::Remove => Write::remove(self.key.as_str(), self.value.clone(), self.record),
        }
    }
}

/// Strategy for generating write operations.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    (
        prop_oneof![
            3 => Just(Action::Add),
            2 => Just(Action::Remove),
        ],
        key_strategy(),
        value_strategy(),
        record_id_strategy(),
    )
        .prop_map(|(action, key, value, record)| WriteOp {
            action,
            key,
            value,
            record,
        })
}

/// Strategy for generating a sequence of write operations.
pub fn write_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), min_ops..max_ops)
}

/// Reference model of what the store should contain.
///
/// Applies the same idempotence rule as the engine: an add is accepted only
/// when the value is absent, a remove only when it is present.
#[derive(Debug, Clone, Default)]
pub struct Model {
    fields: BTreeMap<(RecordId, String), Vec<Value>>,
    revisions: usize,
}

impl Model {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op`, returning whether the engine should accept it.
    pub fn apply(&mut self, op: &WriteOp) -> bool {
        let values = self
            .fields
            .entry((op.record, op.key.clone()))
            .or_default();
        let present = values.contains(&op.value);
        let accepted = match op.action {
            Action::Add if !present => {
                values.push(op.value.clone());
                true
            }
            Action::Remove if present => {
                values.retain(|v| v != &op.value);
                true
            }
            _ => false,
        };
        if accepted {
            self.revisions += 1;
        }
        accepted
    }

    /// Current values of `(key, record)` in insertion order.
    #[must_use]
    pub fn fetch(&self, key: &str, record: RecordId) -> Vec<Value> {
        self.fields
            .get(&(record, key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Keys of `record` holding at least one value.
    #[must_use]
    pub fn describe(&self, record: RecordId) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|((r, _), values)| *r == record && !values.is_empty())
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Fields the model has seen, with or without values.
    pub fn fields(&self) -> impl Iterator<Item = (RecordId, &str)> {
        self.fields.keys().map(|(record, key)| (*record, key.as_str()))
    }

    /// Number of accepted writes.
    #[must_use]
    pub fn revisions(&self) -> usize {
        self.revisions
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;
    use versadb_core::{Destination, Transactional};

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn any_key_starts_with_letter(key in any_key_strategy()) {
            let first = key.chars().next();
            prop_assert!(first.is_some_and(|c| c.is_ascii_lowercase()));
        }

        #[test]
        fn engine_matches_model(ops in write_sequence_strategy(1, 60)) {
            let engine = TestEngine::memory();
            let mut model = Model::new();

            for (i, op) in ops.iter().enumerate() {
                prop_assert_eq!(engine.accept(op.to_write()).unwrap(), model.apply(op));
                if i % 7 == 6 {
                    engine.transport_all().unwrap();
                }
            }

            for (record, key) in model.fields() {
                prop_assert_eq!(engine.fetch(key, record), model.fetch(key, record));
            }
            for record in (0..8).map(RecordId::new) {
                prop_assert_eq!(engine.describe(record), model.describe(record));
            }

            engine.transport_all().unwrap();
            prop_assert_eq!(engine.stats().revisions, model.revisions());
        }

        #[test]
        fn transaction_matches_model(ops in write_sequence_strategy(1, 30)) {
            let engine = TestEngine::memory();
            let mut model = Model::new();

            let mut txn = engine.start_transaction().unwrap();
            for op in &ops {
                let staged = match op.action {
                    Action::Add => txn.add(&op.key, op.value.clone(), op.record).unwrap(),
                    Action::Remove => txn.remove(&op.key, op.value.clone(), op.record).unwrap(),
                };
                prop_assert_eq!(staged, model.apply(op));
            }
            let receipt = txn.commit().unwrap();
            prop_assert_eq!(receipt.accepted, model.revisions());
            prop_assert_eq!(receipt.duplicates, 0);

            for (record, key) in model.fields() {
                prop_assert_eq!(engine.fetch(key, record), model.fetch(key, record));
            }
        }

        #[test]
        fn audit_alternates_actions(ops in write_sequence_strategy(1, 40)) {
            let engine = TestEngine::memory();
            for op in &ops {
                engine.accept(op.to_write()).unwrap();
            }
            for op in &ops {
                let history = engine.audit(&op.key, op.record);
                let toggles: Vec<Action> = history
                    .iter()
                    .filter(|r| r.value == op.value)
                    .map(|r| r.action)
                    .collect();
                for pair in toggles.windows(2) {
                    prop_assert_ne!(pair[0], pair[1]);
                }
                if let Some(first) = toggles.first() {
                    prop_assert_eq!(*first, Action::Add);
                }
                for pair in history.windows(2) {
                    prop_assert!(pair[0].version < pair[1].version);
                }
            }
        }
    }
}

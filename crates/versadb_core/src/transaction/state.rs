//! Transaction lifecycle states.

/// Where a transaction is in its life.
///
/// `Active` → `Committing` → `Committed`, or `Active` → `Aborted`. A commit
/// that fails part way also ends `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accumulating writes.
    Active,
    /// Replaying staged writes into the engine.
    Committing,
    /// Every write went through.
    Committed,
    /// Rolled back; nothing staged reached the engine.
    Aborted,
}

impl TransactionState {
    /// Name used in errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

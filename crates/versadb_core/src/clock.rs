//! Version clock.

use crate::types::Version;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues strictly increasing [`Version`]s anchored to wall-clock time.
///
/// Each call returns `max(now_micros, last + 1)`, so two stamps from the
/// same clock never tie even when the system clock stalls or steps back.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Creates a clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that never issues a version at or below `floor`.
    ///
    /// Used after recovery so new stamps sort after everything on disk.
    #[must_use]
    pub fn starting_after(floor: Version) -> Self {
        Self {
            last: AtomicU64::new(floor.as_u64()),
        }
    }

    /// Returns the next version.
    pub fn now(&self) -> Version {
        let wall = wall_clock_micros();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Version::new(next),
                Err(observed) => last = observed,
            }
        }
    }

    /// Returns the most recently issued version without advancing.
    #[must_use]
    pub fn last(&self) -> Version {
        Version::new(self.last.load(Ordering::Acquire))
    }

    /// Raises the floor so later stamps sort after `version`.
    pub fn observe(&self, version: Version) {
        self.last.fetch_max(version.as_u64(), Ordering::AcqRel);
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

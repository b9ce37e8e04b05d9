//! Multi-granularity locking.
//!
//! Isolation locks keep transactions apart. They are independent of the
//! pipeline guard in [`crate::service`], which only serializes single
//! accepts against buffer-to-database transport.

mod manager;
mod scope;

pub use manager::{LockGuard, LockManager};
pub use scope::{LockMode, LockOwner, LockScope};

//! Lifecycle state store
//!
//! The persisted document, its ordered timeline of phases, and the lock
//! discipline that brackets every mutating operation.

mod document;
mod store;

pub use document::{LifecycleDocument, Phase, RunRecord, Timeline, INITIAL_PHASE};
pub use store::{LockGuard, StateStore};

pub(crate) use store::atomic_write_json_pretty;

//! Progress state reducer
//!
//! Folds the ordered stream of [`ProgressEvent`](crate::events::ProgressEvent)s
//! into a bounded [`ProgressSnapshot`]. Reduction is pure; the periodic
//! cleanup valve lives in [`cleanup`] so it can be tested on its own.

mod bounded;
mod cleanup;
mod snapshot;

pub use bounded::BoundedList;
pub use cleanup::CleanupPolicy;
pub use snapshot::{reduce, AgentOutcome, ProgressLimits, ProgressSnapshot};

//! Run-scoped resources and their cleanup.
//!
//! - [`BoundedPool`] - FIFO admission for runs and sandbox executions
//! - [`CancelSignal`] - per-run cancellation with a recorded reason
//! - [`RunGuard`] - marks a run failed if its driver dies

mod cancel;
mod pool;
mod run_guard;

pub use cancel::{CancelSignal, DeadlineGuard, TIMEOUT_REASON};
pub use pool::BoundedPool;
pub use run_guard::RunGuard;

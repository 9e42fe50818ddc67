//! Public error types.
//!
//! Only [`SupervisorError::SpawnFailed`] is ever returned to a caller of
//! [`crate::supervisor::Supervisor`] — every other failure kind described in
//! spec section 7 (process-gone, permission-denied, task panics, signal
//! registration failures, interrupted sleeps, kill survivors) is swallowed
//! and logged at the point it occurs so that bookkeeping errors never abort
//! the host process.

use thiserror::Error;

/// Errors surfaced by [`crate::supervisor::Supervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to fork/spawn a child process.
    #[error("failed to spawn child process {name:?}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// `add_process` was called with a [`crate::supervisor::ChildTarget::Entry`]
    /// whose name is not present in the harness registry used to re-exec the
    /// current binary.
    #[error("no harness entry point registered under the name {0:?}")]
    UnknownEntry(String),
}

/// Errors surfaced by [`crate::pool::WorkerPool`].
///
/// The pool's public contract (spec section 4.2) never returns a `Result`
/// from `fire_async` — backpressure is communicated via the `bool` return
/// value — so this type exists only for construction-time failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `num_threads` was requested as zero; a pool needs at least one worker.
    #[error("worker pool requires at least one thread, got 0")]
    ZeroThreads,
}

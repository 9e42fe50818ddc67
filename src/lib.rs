//! proc-supervisor — a scoped signal mask, a bounded worker pool, a
//! signal-aware child harness, and the process supervisor that ties them
//! together.
//!
//! The four pieces compose like this: a host builds a
//! [`supervisor::Supervisor`], registers named child entry points with a
//! [`harness::HarnessRegistry`], spawns them with
//! [`supervisor::Supervisor::add_process`], and calls
//! [`supervisor::Supervisor::run`] to monitor and restart them. Spawning a
//! signal-handling child happens inside [`signals::with_default_signals`]
//! so the child is never born with the parent's handlers still attached.
//! The worker pool in [`pool`] is independent of all of this — a separate,
//! lighter-weight fire-and-forget mechanism for in-process background work
//! that doesn't need its own OS process.

pub mod error;
pub mod exitcodes;
pub mod harness;
pub mod logging;
pub mod platform;
pub mod pool;
pub mod signals;
pub mod supervisor;

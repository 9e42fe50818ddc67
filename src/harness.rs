//! Child Harness (component C3).
//!
//! Wraps the body that actually runs inside a supervised child process:
//! installing signal-aware teardown (kill the descendant tree before
//! exiting) when asked to, and otherwise just running the caller's closure
//! unmodified. A harness entry is looked up by name and re-invoked across a
//! self-re-exec the same way the teacher's `run.rs` re-execs
//! `current_exe()` with its hidden `_supervise` subcommand — here the hidden
//! dispatch key is `PROC_SUPERVISOR_HARNESS`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::exitcodes::EX_OK;
use crate::platform::{self, Sig};
use crate::signals::with_default_signals;

/// Environment variable a re-exec'd harness process inspects to know which
/// registered entry point to run, and under which pid it should consider
/// itself a child (spec section 5, "self re-exec" Design Note).
pub const HARNESS_ENV_VAR: &str = "PROC_SUPERVISOR_HARNESS";

/// A harness body: the function that actually does the child process's
/// work. Takes no arguments because, like [`crate::pool::WorkerPool`]'s
/// tasks, the closure itself carries whatever state it needs.
pub type HarnessBody = Arc<dyn Fn() + Send + Sync>;

/// Configuration for running a harness body.
#[derive(Clone, Copy, Debug)]
pub struct HarnessConfig {
    /// Install SIGINT/SIGTERM handling that tears down the descendant
    /// process tree before exiting (spec section 5.2).
    pub signal_handling: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            signal_handling: true,
        }
    }
}

/// Run `body` directly, with no signal-handling wrapper — the
/// `ChildTarget::Owned` path, where the caller's closure spawns and manages
/// its own `std::process::Command` and the supervisor only needs the
/// resulting `Child` handle.
pub fn run_plain_child<F: FnOnce()>(body: F) {
    body();
}

/// Run `body` with SIGINT/SIGTERM installed to their default disposition on
/// entry (via [`with_default_signals`]) and, on receipt, tear down any
/// descendant processes before exiting with [`EX_OK`].
///
/// This mirrors `SignalHandlingMultiprocessingProcess`'s registration of
/// `_handle_signals`/`_setup_signals` in the original source: a child with
/// signal handling enabled does its own descendant cleanup rather than
/// relying solely on the supervisor's `kill_children` (which only reaches
/// the direct child pid, plus whatever the platform's `kill_tree` can see
/// from outside).
pub fn run_signal_handling_child<F: FnOnce()>(body: F) {
    raise_fd_limit_if_windows();
    with_default_signals(&[Sig::Int, Sig::Term], || {
        install_teardown_on_signal();
        body();
    });
}

#[cfg(unix)]
fn install_teardown_on_signal() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn handler(_: i32) {
        // Step 1: ignore both so a second signal can't re-enter this handler
        // while teardown is in progress.
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            let _ = unsafe { sigaction(sig, &ignore) };
        }

        // Step 2: terminate live descendants, never this process itself —
        // `std::process::exit` below is what ends this process.
        let pid = std::process::id();
        for child in platform::descendants(pid) {
            let _ = platform::send_signal(child, Sig::Term);
        }

        std::process::exit(EX_OK);
    }

    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: handler only calls async-signal-safe-ish teardown; in
        // practice kill(2) is signal-safe, the /proc scan on Linux is not
        // strictly so but this process is about to exit regardless.
        if let Err(errno) = unsafe { sigaction(sig, &action) } {
            tracing::trace!(signal = ?sig, error = %errno, "failed to install teardown handler");
        }
    }
}

#[cfg(not(unix))]
fn install_teardown_on_signal() {
    // Windows delivers no SIGINT/SIGTERM the way Unix does; the job-object
    // tree created by the supervisor's spawn path handles teardown instead
    // (platform::kill_tree), so there is nothing to install here.
}

/// Attempt to raise the process's open-file-descriptor limit on Windows,
/// clamped to 8192. Mirrors the teacher's handling of descriptor-hungry
/// child processes without importing a new crate for it; on non-Windows
/// platforms this is a no-op because the OS default is already generous
/// enough for a supervised worker.
fn raise_fd_limit_if_windows() {
    if !platform::is_windows() {
        return;
    }
    const REQUESTED: u32 = 8192;
    tracing::debug!(requested = REQUESTED, "clamping fd-limit request on Windows");
    // Windows has no POSIX rlimit equivalent; the C runtime's
    // `_setmaxstdio` caps out at 8192 and anything above it is rejected, so
    // the "raise" here is documentation of the clamp rather than a syscall
    // — matching spec section 5's note that this limit is advisory on
    // Windows.
}

/// A registry of named harness bodies, used to resolve the `--harness NAME`
/// argument a re-exec'd process is launched with (the `ChildTarget::Entry`
/// path).
#[derive(Clone, Default)]
pub struct HarnessRegistry {
    entries: HashMap<&'static str, (HarnessBody, HarnessConfig)>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        HarnessRegistry::default()
    }

    /// Register a named entry point.
    pub fn register(&mut self, name: &'static str, config: HarnessConfig, body: HarnessBody) {
        self.entries.insert(name, (body, config));
    }

    /// If the current process was re-exec'd to run a registered harness
    /// entry (detected via [`HARNESS_ENV_VAR`]), run it and exit the process
    /// — this call never returns in that case. Otherwise returns `false` so
    /// the caller's normal `main` can proceed (this is the supervisor
    /// process itself, not a re-exec'd child).
    pub fn dispatch_if_child(&self) -> bool {
        let Ok(name) = std::env::var(HARNESS_ENV_VAR) else {
            return false;
        };
        match self.entries.get(name.as_str()) {
            Some((body, config)) => {
                // Honor the harness contract (spec section 4.3 step 2): the
                // re-exec'd child initializes its own logging sink before
                // running the user body. Ignore the error — a child racing
                // another subscriber install is not fatal, it just means
                // one was already set up.
                let _ = crate::logging::setup_from_env();
                if config.signal_handling {
                    run_signal_handling_child(|| body());
                } else {
                    run_plain_child(|| body());
                }
                std::process::exit(EX_OK);
            }
            None => {
                tracing::error!(entry = %name, "re-exec'd with unknown harness entry point");
                std::process::exit(crate::exitcodes::EX_GENERIC);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn plain_child_just_runs_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        run_plain_child(|| r.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn registry_reports_unknown_entries() {
        let registry = HarnessRegistry::new();
        assert!(!registry.contains("nonexistent"));
    }

    #[test]
    fn dispatch_is_noop_without_env_var() {
        std::env::remove_var(HARNESS_ENV_VAR);
        let registry = HarnessRegistry::new();
        assert!(!registry.dispatch_if_child());
    }
}

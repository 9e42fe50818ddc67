//! Scoped Signal-Mask (component C1).
//!
//! `with_default_signals` temporarily restores the platform-default
//! disposition for a list of signals for the duration of a closure, then
//! restores whatever was in place before — used by the supervisor so a
//! freshly forked/spawned child is not born with the parent's SIGINT/SIGTERM
//! handlers still installed (spec section 4.1).

use crate::platform::Sig;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

#[cfg(unix)]
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

#[cfg(unix)]
fn to_nix(sig: Sig) -> Signal {
    match sig {
        Sig::Int => Signal::SIGINT,
        Sig::Term => Signal::SIGTERM,
        Sig::Kill => Signal::SIGKILL,
    }
}

/// Run `body` with each of `signals` temporarily reset to its default
/// disposition, restoring the prior disposition on the way out — whether
/// `body` returns normally or panics.
///
/// Signals that fail to save/install (for example because this was called
/// off the main thread, where some platforms disallow signal registration)
/// are logged at `trace` level and simply skipped: only signals that were
/// actually swapped get restored (spec section 4.1 / error kind
/// `SignalRegisterFailed`).
pub fn with_default_signals<F, R>(signals: &[Sig], body: F) -> R
where
    F: FnOnce() -> R,
{
    let swapped = install_defaults(signals);
    let result = catch_unwind(AssertUnwindSafe(body));
    restore(swapped);
    match result {
        Ok(value) => value,
        Err(payload) => resume_unwind(payload),
    }
}

#[cfg(unix)]
fn install_defaults(signals: &[Sig]) -> Vec<(Signal, SigAction)> {
    let mut swapped = Vec::with_capacity(signals.len());
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for &sig in signals {
        let nix_sig = to_nix(sig);
        // SAFETY: sigaction is only unsafe insofar as the handler it
        // installs must be signal-safe; SigDfl is always signal-safe.
        match unsafe { sigaction(nix_sig, &default) } {
            Ok(prior) => swapped.push((nix_sig, prior)),
            Err(errno) => {
                tracing::trace!(signal = %sig.as_str(), error = %errno, "failed to register default disposition, skipping");
            }
        }
    }
    swapped
}

#[cfg(unix)]
fn restore(swapped: Vec<(Signal, SigAction)>) {
    for (sig, prior) in swapped {
        // SAFETY: restoring a previously-observed disposition.
        if let Err(errno) = unsafe { sigaction(sig, &prior) } {
            tracing::trace!(signal = ?sig, error = %errno, "failed to restore prior disposition");
        }
    }
}

#[cfg(not(unix))]
fn install_defaults(_signals: &[Sig]) -> Vec<()> {
    Vec::new()
}

#[cfg(not(unix))]
fn restore(_swapped: Vec<()>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_body_and_returns_value() {
        let value = with_default_signals(&[Sig::Term, Sig::Int], || 42);
        assert_eq!(value, 42);
    }

    #[test]
    #[cfg(unix)]
    fn restores_prior_disposition_after_body() {
        use nix::sys::signal::{sigaction, SigHandler};

        extern "C" fn marker_handler(_: i32) {}

        let prior = unsafe {
            sigaction(
                Signal::SIGUSR1,
                &SigAction::new(
                    SigHandler::Handler(marker_handler),
                    SaFlags::empty(),
                    SigSet::empty(),
                ),
            )
            .expect("install marker handler")
        };

        with_default_signals(&[Sig::Term], || {
            // body runs with SIGTERM reset to default; SIGUSR1 is untouched.
            let current = unsafe { sigaction(Signal::SIGUSR1, &prior) }.expect("read disposition");
            assert!(matches!(current.handler(), SigHandler::Handler(_)));
        });

        // restore our marker for cleanliness of the process-wide signal table
        unsafe { sigaction(Signal::SIGUSR1, &prior) }.expect("restore marker");
    }

    #[test]
    #[cfg(unix)]
    fn restores_even_when_body_panics() {
        use nix::sys::signal::{sigaction, SigAction, SigHandler, SaFlags, SigSet};

        // Mark SIGUSR2's disposition as Ignore, then have the panicking body
        // swap it to default; afterward it must read back as Ignore again.
        let marked = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGUSR2, &marked) }.expect("install marker");

        // with_default_signals only understands the crate's own `Sig` enum
        // (Int/Term/Kill), so reuse its internal helpers directly against
        // SIGUSR2 to exercise the same save/restore path under panic.
        let swapped = install_defaults_raw(Signal::SIGUSR2);
        let result = catch_unwind(AssertUnwindSafe(|| {
            panic!("boom");
        }));
        restore(swapped);
        assert!(result.is_err());

        let readback = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let after = unsafe { sigaction(Signal::SIGUSR2, &readback) }.expect("read back");
        assert!(matches!(after.handler(), SigHandler::SigIgn));
    }

    #[cfg(unix)]
    fn install_defaults_raw(sig: Signal) -> Vec<(Signal, SigAction)> {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        match unsafe { sigaction(sig, &default) } {
            Ok(prior) => vec![(sig, prior)],
            Err(_) => Vec::new(),
        }
    }
}

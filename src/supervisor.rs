//! Process Supervisor (component C4).
//!
//! Owns a `pid -> ChildRecord` map, starts and restarts supervised
//! children, and tears the whole tree down on request. Mirrors
//! `ProcessManager` from the original source, minus the parts the Non-goals
//! exclude (cross-host supervision, generic priority scheduling).

use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::error::SupervisorError;
use crate::harness::{HarnessRegistry, HARNESS_ENV_VAR};
use crate::platform::{self, Sig};
use crate::signals::with_default_signals;

/// A supervised child's pid, returned from [`Supervisor::add_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId(pub u32);

/// Arguments handed to a [`ChildTarget::Owned`] spawn closure.
#[derive(Debug, Clone, Default)]
pub struct ChildArgs {
    pub args: Vec<String>,
    pub kwargs: Map<String, Value>,
}

/// Object-safe handle to a running child process.
///
/// Implemented by [`ManagedChild`] for real `std::process::Child`-backed
/// children; a test double can implement it directly to exercise the
/// supervisor's bookkeeping without spawning real processes.
pub trait ChildHandle: Send {
    fn pid(&self) -> u32;
    /// Poll for liveness. Takes `&mut self` because checking generally
    /// requires a non-blocking `try_wait`, which may cache an exit status.
    fn is_alive(&mut self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn terminate(&mut self) -> io::Result<()>;
    /// Block up to `timeout` for the child to exit. Returns `true` if it
    /// did.
    fn join(&mut self, timeout: Duration) -> bool;
}

/// A [`ChildHandle`] backed by a real `std::process::Child`.
pub struct ManagedChild {
    child: std::process::Child,
    exit_code: Option<i32>,
}

impl ManagedChild {
    pub fn new(child: std::process::Child) -> Self {
        ManagedChild {
            child,
            exit_code: None,
        }
    }
}

impl ChildHandle for ManagedChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code().unwrap_or(-1));
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn terminate(&mut self) -> io::Result<()> {
        platform::send_signal(self.child.id(), Sig::Term).map(|_| ())
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// The tagged variant called for in the "dynamic dispatch on target shape"
/// design note: rather than asking "is `target` a class or a function" at
/// runtime, the caller states up front which shape it is.
#[derive(Clone)]
pub enum ChildTarget {
    /// The caller's own closure builds and spawns the `Command`; it owns
    /// its harness entirely. `signal_handling` still controls whether
    /// `add_process` wraps the spawn call in
    /// [`with_default_signals`].
    Owned {
        spawn: Arc<dyn Fn(&ChildArgs) -> io::Result<std::process::Child> + Send + Sync>,
        signal_handling: bool,
    },
    /// A named entry registered with a [`HarnessRegistry`]; the supervisor
    /// re-execs the current binary with [`HARNESS_ENV_VAR`] set to `name`
    /// so the child process dispatches into the registered body.
    Entry {
        name: &'static str,
        signal_handling: bool,
    },
}

/// The supervisor's in-memory bookkeeping for one child.
pub struct ChildRecord {
    pub name: String,
    pub target: ChildTarget,
    pub args: Vec<String>,
    pub kwargs: Map<String, Value>,
    pub opts: Map<String, Value>,
    pub handle: Box<dyn ChildHandle>,
}

/// Construction-time configuration, analogous to the teacher's `*Opts`
/// structs.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub name: String,
    pub wait_for_kill: Duration,
    pub restart_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            name: "supervisor".to_string(),
            wait_for_kill: Duration::from_secs(1),
            restart_enabled: true,
        }
    }
}

/// How [`Supervisor::run`] waits between polls of the process map.
pub enum RunMode<'a> {
    /// Block the calling thread on each poll interval.
    Blocking,
    /// Cooperatively yield the poll interval to a host event loop, which
    /// calls back in after (approximately) `Duration` has elapsed.
    EventDriven(&'a mut dyn FnMut(Duration)),
}

#[cfg(unix)]
#[derive(Clone, Copy)]
enum PriorHandler {
    Default,
    Ignore,
    Handler(nix::sys::signal::SigHandler),
}

/// The parent-side object tracking supervised child processes.
///
/// Intentionally carries no `Mutex`/`Arc` around its own state: per spec,
/// the process map is only ever touched from the supervisor's own thread
/// (and from its own signal handler, which runs on that same thread), so no
/// synchronization is needed. This also means `Supervisor` is not meant to
/// be shared across threads — callers who need that must add their own
/// synchronization on top.
pub struct Supervisor {
    name: String,
    wait_for_kill: Duration,
    restart_enabled: AtomicBool,
    owner_pid: u32,
    process_map: HashMap<u32, ChildRecord>,
    registry: Arc<HarnessRegistry>,
    next_anonymous_id: AtomicU32,
    #[cfg(unix)]
    prior_sigterm_handler: Option<PriorHandler>,
    #[cfg(unix)]
    prior_sigint_handler: Option<PriorHandler>,
    interrupted: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, registry: Arc<HarnessRegistry>) -> Self {
        Supervisor {
            name: config.name,
            wait_for_kill: config.wait_for_kill,
            restart_enabled: AtomicBool::new(config.restart_enabled),
            owner_pid: std::process::id(),
            process_map: HashMap::new(),
            registry,
            next_anonymous_id: AtomicU32::new(0),
            #[cfg(unix)]
            prior_sigterm_handler: None,
            #[cfg(unix)]
            prior_sigint_handler: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.process_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.process_map.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.process_map.contains_key(&pid)
    }

    /// §4.4.1 — spawn and record a new child.
    pub fn add_process(
        &mut self,
        target: ChildTarget,
        args: Vec<String>,
        kwargs: Map<String, Value>,
        name: Option<String>,
    ) -> Result<ChildId, SupervisorError> {
        let opts = Map::new();
        self.add_process_with_opts(target, args, kwargs, opts, name)
    }

    fn add_process_with_opts(
        &mut self,
        target: ChildTarget,
        args: Vec<String>,
        kwargs: Map<String, Value>,
        opts: Map<String, Value>,
        name: Option<String>,
    ) -> Result<ChildId, SupervisorError> {
        let derived_name = name.unwrap_or_else(|| self.derive_name(&target));

        let handle: Box<dyn ChildHandle> = match &target {
            ChildTarget::Owned {
                spawn,
                signal_handling,
            } => {
                let child_args = ChildArgs {
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                };
                let spawn = Arc::clone(spawn);
                let spawned = if *signal_handling {
                    with_default_signals(&[Sig::Int, Sig::Term], || spawn(&child_args))
                } else {
                    spawn(&child_args)
                };
                let child = spawned.map_err(|source| SupervisorError::SpawnFailed {
                    name: derived_name.clone(),
                    source,
                })?;
                Box::new(ManagedChild::new(child))
            }
            ChildTarget::Entry {
                name: entry_name,
                signal_handling,
            } => {
                let entry_name: &'static str = *entry_name;
                if !self.registry.contains(entry_name) {
                    return Err(SupervisorError::UnknownEntry(entry_name.to_string()));
                }
                let spawn_fn = |args: &[String]| -> io::Result<std::process::Child> {
                    let exe = std::env::current_exe()?;
                    Command::new(exe)
                        .env(HARNESS_ENV_VAR, entry_name)
                        .args(args)
                        .spawn()
                };
                let spawned = if *signal_handling {
                    with_default_signals(&[Sig::Int, Sig::Term], || spawn_fn(&args))
                } else {
                    spawn_fn(&args)
                };
                let child = spawned.map_err(|source| SupervisorError::SpawnFailed {
                    name: derived_name.clone(),
                    source,
                })?;
                Box::new(ManagedChild::new(child))
            }
        };

        let pid = handle.pid();
        tracing::info!(pid, name = %derived_name, "child process started");
        self.process_map.insert(
            pid,
            ChildRecord {
                name: derived_name,
                target,
                args,
                kwargs,
                opts,
                handle,
            },
        );
        Ok(ChildId(pid))
    }

    fn derive_name(&self, target: &ChildTarget) -> String {
        let label = match target {
            ChildTarget::Owned { .. } => "owned".to_string(),
            ChildTarget::Entry { name, .. } => name.to_string(),
        };
        let counter = self.next_anonymous_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}-{}", self.name, label, counter)
    }

    /// §4.4.3 — restart any dead child if restarts are enabled.
    pub fn check_children(&mut self) {
        if !self.restart_enabled.load(Ordering::SeqCst) {
            return;
        }
        let dead: Vec<u32> = self
            .process_map
            .iter_mut()
            .filter(|(_, record)| !record.handle.is_alive())
            .map(|(&pid, _)| pid)
            .collect();
        for pid in dead {
            self.restart_process(pid);
        }
    }

    /// §4.4.4 — replace a dead child with a fresh one sharing its spec.
    pub fn restart_process(&mut self, pid: u32) {
        let Some(mut record) = self.process_map.remove(&pid) else {
            return;
        };
        let exit_code = record.handle.exit_code();
        tracing::warn!(pid, exit_code, name = %record.name, "child died, restarting");
        record.handle.join(Duration::from_secs(1));

        if !record.opts.is_empty() {
            record
                .kwargs
                .insert("__opts".to_string(), Value::Object(record.opts.clone()));
        }

        match self.add_process_with_opts(
            record.target,
            record.args,
            record.kwargs,
            Map::new(),
            Some(record.name),
        ) {
            Ok(_) => {}
            Err(err) => {
                tracing::error!(pid, error = %err, "failed to restart child");
            }
        }
    }

    /// §4.4.5 — disable restarts; subsequent dead children stay dead.
    pub fn stop_restarting(&mut self) {
        self.restart_enabled.store(false, Ordering::SeqCst);
    }

    /// §4.4.6 — broadcast a signal to every tracked child.
    pub fn send_signal_to_processes(&mut self, sig: Sig) {
        if !platform::can_send_console_signal(sig) {
            tracing::debug!(signal = sig.as_str(), "signal is a no-op on this platform, skipping");
            return;
        }
        let pids: Vec<u32> = self.process_map.keys().copied().collect();
        let mut gone = Vec::new();
        for pid in pids {
            match platform::send_signal(pid, sig) {
                Ok(platform::SignalOutcome::Sent) => {}
                Ok(platform::SignalOutcome::Gone) => gone.push(pid),
                Err(error) => {
                    tracing::error!(pid, %error, "failed to signal child");
                }
            }
        }
        for pid in gone {
            self.process_map.remove(&pid);
        }
    }

    /// §4.4.7 — multi-phase bounded-retry shutdown of every tracked child.
    pub fn kill_children(&mut self, triggering_signal: Option<Sig>, retry: u32) {
        // Phase 0: guard and ignore re-entry.
        self.install_ignore_dispositions();
        if std::process::id() != self.owner_pid {
            self.delegate_to_prior_handler();
            return;
        }

        // Phase 1: request termination.
        let pids: Vec<u32> = self.process_map.keys().copied().collect();
        for pid in &pids {
            if let Some(sig) = triggering_signal {
                let _ = platform::send_signal(*pid, sig);
            }
            if let Some(record) = self.process_map.get_mut(pid) {
                match record.handle.terminate() {
                    Ok(()) => {}
                    Err(error) => {
                        tracing::trace!(pid, %error, "terminate failed, likely already gone");
                    }
                }
            }
        }
        self.reap_dead();

        // Phase 2: graceful wait.
        let deadline = Instant::now() + self.wait_for_kill;
        while !self.process_map.is_empty() && Instant::now() < deadline {
            self.reap_dead();
            std::thread::sleep(Duration::from_millis(20));
        }

        // Phase 3: forced kill, up to two iterations.
        for _ in 0..2 {
            if self.process_map.is_empty() {
                break;
            }
            let pids: Vec<u32> = self.process_map.keys().copied().collect();
            for pid in pids {
                let _ = platform::send_signal(pid, Sig::Kill);
            }
            std::thread::sleep(Duration::from_millis(50));
            self.reap_dead();
        }

        // Phase 4: retry or concede.
        if !self.process_map.is_empty() {
            if retry > 0 {
                let stragglers: Vec<u32> = self.process_map.keys().copied().collect();
                tracing::warn!(?stragglers, retry, "children survived kill, retrying");
                self.kill_children(None, retry - 1);
            } else {
                let survivors: Vec<u32> = self.process_map.keys().copied().collect();
                tracing::warn!(?survivors, "children survived kill, giving up");
            }
        }
    }

    fn reap_dead(&mut self) {
        let dead: Vec<u32> = self
            .process_map
            .iter_mut()
            .filter(|(_, record)| !record.handle.is_alive())
            .map(|(&pid, _)| pid)
            .collect();
        for pid in dead {
            self.process_map.remove(&pid);
        }
    }

    #[cfg(unix)]
    fn install_ignore_dispositions(&self) {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            if let Err(errno) = unsafe { sigaction(sig, &ignore) } {
                tracing::trace!(signal = ?sig, error = %errno, "failed to install ignore disposition");
            }
        }
    }

    #[cfg(not(unix))]
    fn install_ignore_dispositions(&self) {}

    #[cfg(unix)]
    fn delegate_to_prior_handler(&self) {
        // Delegation only makes sense for a real installed handler function;
        // Default/Ignore dispositions have nothing to call, and raising the
        // signal again would just re-enter this same handler.
        if let Some(PriorHandler::Handler(nix::sys::signal::SigHandler::Handler(f))) =
            self.prior_sigterm_handler
        {
            f(nix::sys::signal::Signal::SIGTERM as i32);
        }
    }

    #[cfg(not(unix))]
    fn delegate_to_prior_handler(&self) {}

    /// §4.4.2 — enter the monitoring loop. Installs `kill_children` as the
    /// interrupt/terminate handler only if the current disposition is the
    /// platform default (never overwrites a handler a host already
    /// installed); the disposition that was in place before is remembered
    /// so a re-entrant invocation from an inherited child can delegate to
    /// it (§4.4.7 Phase 0 / Testable Property 8).
    pub fn run(&mut self, mode: RunMode<'_>) {
        self.set_process_title();
        self.install_shutdown_handler();

        let mut mode = mode;
        loop {
            self.check_children();

            match &mut mode {
                RunMode::Blocking => std::thread::sleep(Duration::from_secs(10)),
                RunMode::EventDriven(driver) => driver(Duration::from_secs(10)),
            }

            if self.process_map.is_empty() {
                break;
            }
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    fn set_process_title(&self) {
        // No dependency-free cross-platform way to rename the running
        // process's argv[0] in place; logging the intended title is the
        // closest equivalent available without adding a crate purely for
        // this cosmetic step.
        tracing::debug!(name = %self.name, "supervisor starting monitoring loop");
    }

    /// Probes the current INT/TERM disposition and installs
    /// [`kill_children`](Self::kill_children) as the handler only if that
    /// disposition is still the platform default, remembering whatever was
    /// there before so [`kill_children`](Self::kill_children)'s Phase 0
    /// guard can delegate to it from a non-owner pid. Called by
    /// [`run`](Self::run); exposed directly for hosts (and tests) that want
    /// the handler installed without entering the monitoring loop.
    #[cfg(unix)]
    pub fn install_shutdown_handler(&mut self) {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for (signal, slot) in [
            (Signal::SIGTERM, &mut self.prior_sigterm_handler),
            (Signal::SIGINT, &mut self.prior_sigint_handler),
        ] {
            let Ok(prior) = (unsafe { sigaction(signal, &probe) }) else {
                continue;
            };
            let prior_kind = classify(prior.handler());
            if matches!(prior_kind, PriorHandler::Default) {
                // current disposition was default (we just re-installed
                // default, a no-op); install our own handler instead.
                let flag = Arc::clone(&self.interrupted);
                INTERRUPTED_FLAG.with(|cell| *cell.borrow_mut() = Some(flag));
                let ours = SigAction::new(
                    SigHandler::Handler(supervisor_signal_trampoline),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                let _ = unsafe { sigaction(signal, &ours) };
            } else {
                // leave the host's handler in place; restore exactly what
                // we overwrote during the probe.
                let _ = unsafe { sigaction(signal, &prior) };
            }
            *slot = Some(prior_kind);
        }
    }

    #[cfg(not(unix))]
    pub fn install_shutdown_handler(&mut self) {}
}

#[cfg(unix)]
fn classify(handler: nix::sys::signal::SigHandler) -> PriorHandler {
    use nix::sys::signal::SigHandler;
    match handler {
        SigHandler::SigDfl => PriorHandler::Default,
        SigHandler::SigIgn => PriorHandler::Ignore,
        other => PriorHandler::Handler(other),
    }
}

#[cfg(unix)]
thread_local! {
    static INTERRUPTED_FLAG: std::cell::RefCell<Option<Arc<AtomicBool>>> = std::cell::RefCell::new(None);
}

#[cfg(unix)]
extern "C" fn supervisor_signal_trampoline(_: i32) {
    INTERRUPTED_FLAG.with(|cell| {
        if let Some(flag) = cell.borrow().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    });
}

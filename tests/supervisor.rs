//! Integration tests for the process supervisor, spawning real child
//! processes via `std::process::Command` rather than the harness registry's
//! self-re-exec path (which needs the compiled demo binary) — exercising
//! `Supervisor` as a library consumer would.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;

use proc_supervisor::harness::HarnessRegistry;
#[cfg(windows)]
use proc_supervisor::platform::Sig;
use proc_supervisor::supervisor::{ChildTarget, Supervisor, SupervisorConfig};

fn empty_registry() -> Arc<HarnessRegistry> {
    Arc::new(HarnessRegistry::new())
}

fn shell_command(script: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", script]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", script]);
        c
    };
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());
    cmd
}

fn owned_target(script: &'static str, signal_handling: bool) -> ChildTarget {
    ChildTarget::Owned {
        spawn: Arc::new(move |_args| shell_command(script).spawn()),
        signal_handling,
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, poll: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll);
    }
}

/// Property 1 — a successful `add_process` call's returned pid is a key in
/// the map immediately afterward.
#[test]
fn add_process_pid_is_in_map_immediately() {
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
    let id = supervisor
        .add_process(
            owned_target("exit 0", false),
            Vec::new(),
            Map::new(),
            None,
        )
        .expect("spawn should succeed");
    assert!(supervisor.contains(id.0));
}

/// Scenario S1 — a crashing child is restarted under the same target.
#[test]
fn restart_on_crash() {
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
    let id = supervisor
        .add_process(
            owned_target("sleep 0.2; exit 7", false),
            Vec::new(),
            Map::new(),
            Some("crasher".to_string()),
        )
        .expect("spawn should succeed");

    let ok = wait_until(Duration::from_millis(1500), Duration::from_millis(20), || {
        supervisor.check_children();
        !supervisor.contains(id.0) && supervisor.len() == 1
    });
    assert!(ok, "expected the dead pid to be replaced by a new entry");
}

/// Scenario S2 — after `stop_restarting`, a dead child is not replaced and
/// the map empties.
#[test]
fn stop_restarting_drains_the_map() {
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
    supervisor
        .add_process(
            owned_target("sleep 0.2; exit 7", false),
            Vec::new(),
            Map::new(),
            None,
        )
        .expect("spawn should succeed");
    supervisor.stop_restarting();

    let ok = wait_until(Duration::from_millis(1500), Duration::from_millis(20), || {
        supervisor.check_children();
        supervisor.is_empty()
    });
    assert!(ok, "map should drain to empty once restarts are disabled");
}

/// Property 4 — after `stop_restarting`, no subsequent `check_children`
/// restarts a dead child, even across several polls.
#[test]
fn no_restart_after_stop_restarting_across_multiple_polls() {
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
    supervisor
        .add_process(
            owned_target("exit 3", false),
            Vec::new(),
            Map::new(),
            None,
        )
        .expect("spawn should succeed");
    supervisor.stop_restarting();

    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(50));
        supervisor.check_children();
    }
    assert!(supervisor.is_empty());
}

#[cfg(unix)]
/// Scenario S4 — graceful shutdown escalates to a forced kill within the
/// configured budget when children ignore the terminate signal.
#[test]
fn graceful_shutdown_escalates_to_kill() {
    let mut supervisor = Supervisor::new(
        SupervisorConfig {
            wait_for_kill: Duration::from_millis(200),
            ..SupervisorConfig::default()
        },
        empty_registry(),
    );

    for _ in 0..3 {
        supervisor
            .add_process(
                owned_target("trap '' TERM; sleep 5", false),
                Vec::new(),
                Map::new(),
                None,
            )
            .expect("spawn should succeed");
    }
    assert_eq!(supervisor.len(), 3);

    let started = Instant::now();
    supervisor.kill_children(None, 3);
    let elapsed = started.elapsed();

    assert!(supervisor.is_empty());
    assert!(
        elapsed < Duration::from_secs(3),
        "shutdown should escalate well within the retry budget, took {elapsed:?}"
    );
}

/// Property 5 — `kill_children` always leaves the map empty or concedes
/// with retries exhausted; never panics, never leaves an inconsistent
/// state for a non-adversarial child.
#[test]
fn kill_children_converges_on_cooperative_children() {
    let mut supervisor = Supervisor::new(
        SupervisorConfig {
            wait_for_kill: Duration::from_millis(100),
            ..SupervisorConfig::default()
        },
        empty_registry(),
    );
    supervisor
        .add_process(
            owned_target("sleep 5", false),
            Vec::new(),
            Map::new(),
            None,
        )
        .expect("spawn should succeed");

    supervisor.kill_children(None, 3);
    assert!(supervisor.is_empty());
}

#[cfg(windows)]
/// Scenario S5 — on Windows, sending INT/TERM through
/// `send_signal_to_processes` is a no-op and the map is left unchanged.
#[test]
fn windows_console_signal_is_a_noop() {
    let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
    let id = supervisor
        .add_process(
            owned_target("ping -n 5 127.0.0.1 >NUL", false),
            Vec::new(),
            Map::new(),
            None,
        )
        .expect("spawn should succeed");

    supervisor.send_signal_to_processes(Sig::Term);
    assert!(supervisor.contains(id.0));
    supervisor.kill_children(None, 1);
}

#[cfg(all(unix, test))]
mod inherited_child_delegation {
    //! Scenario S6 — a child inheriting the supervisor's terminate handler
    //! must delegate to whatever handler was installed before the
    //! supervisor's own, and must never touch the parent's map.
    //!
    //! Test-only use of `fork`: the forked child runs in its own address
    //! space (copy-on-write), so mutating anything there can never be
    //! observed as a parent-side mutation; a byte written down a pipe is
    //! the only way the child can report back.

    use super::*;
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    // A plain libc-backed pipe rather than nix's fd-ownership wrappers,
    // since this is the one place in the test suite that needs raw fds on
    // both sides of a fork.
    fn raw_pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() failed");
        (fds[0], fds[1])
    }

    fn raw_write_byte(fd: i32, byte: u8) {
        let buf = [byte];
        unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn raw_read_byte(fd: i32) -> u8 {
        let mut buf = [0u8; 1];
        unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
        }
        buf[0]
    }

    static PRIOR_HANDLER_RAN: AtomicBool = AtomicBool::new(false);

    extern "C" fn prior_handler(_: i32) {
        PRIOR_HANDLER_RAN.store(true, Ordering::SeqCst);
    }

    #[test]
    fn delegates_to_prior_handler_without_touching_parent_map() {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        let install = SigAction::new(
            SigHandler::Handler(prior_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let original = unsafe { sigaction(Signal::SIGTERM, &install) }.expect("install handler");

        let mut supervisor = Supervisor::new(SupervisorConfig::default(), empty_registry());
        supervisor
            .add_process(
                owned_target("sleep 5", false),
                Vec::new(),
                Map::new(),
                None,
            )
            .expect("spawn should succeed");
        assert_eq!(supervisor.len(), 1);

        // Our own `prior_handler` is not the platform default, so this
        // records it as the prior disposition to delegate to rather than
        // overwriting it.
        supervisor.install_shutdown_handler();

        let (read_fd, write_fd) = raw_pipe();

        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                unsafe { libc::close(read_fd) };
                // The forked child's pid differs from owner_pid, so Phase 0
                // of kill_children must delegate to prior_handler instead
                // of touching the (copy-on-write, child-local) map.
                supervisor.kill_children(None, 0);
                let reported = if PRIOR_HANDLER_RAN.load(Ordering::SeqCst) {
                    1
                } else {
                    0
                };
                raw_write_byte(write_fd, reported);
                unsafe { libc::close(write_fd) };
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                unsafe { libc::close(write_fd) };
                let reported = raw_read_byte(read_fd);
                unsafe { libc::close(read_fd) };
                let _ = waitpid(child, None);

                assert_eq!(reported, 1, "child should have invoked the prior handler");
                // Parent's own map and handler-ran flag are untouched by
                // whatever happened in the forked child's address space.
                assert_eq!(supervisor.len(), 1);
                assert!(!PRIOR_HANDLER_RAN.load(Ordering::SeqCst));
            }
        }

        let _ = unsafe { sigaction(Signal::SIGTERM, &original) };
    }
}

//! Platform divergence, factored into one place per spec section 9 ("Platform
//! divergence"): `kill_tree`, `send_signal`, and `can_send_console_signal` are
//! the only OS-specific surface the rest of the crate touches.

use std::io;

/// The crate's own signal vocabulary, kept small and cross-platform instead
/// of leaking `nix::sys::signal::Signal` (Unix-only) into the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sig {
    Int,
    Term,
    Kill,
}

impl Sig {
    pub fn as_str(self) -> &'static str {
        match self {
            Sig::Int => "INT",
            Sig::Term => "TERM",
            Sig::Kill => "KILL",
        }
    }
}

/// Whether the current process is running on Windows.
///
/// A function wrapper around `cfg!(windows)` so call sites read the same as
/// spec section 6's `is_windows()` predicate, rather than scattering
/// `cfg!`/`#[cfg]` checks through the supervisor logic.
pub fn is_windows() -> bool {
    cfg!(windows)
}

/// Outcome of attempting to signal a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered (or at least accepted by the kernel).
    Sent,
    /// The process was already gone, or we lack permission to signal it —
    /// spec section 7 treats both as "already dead" and has the caller
    /// remove the bookkeeping entry rather than propagate an error.
    Gone,
}

/// Send `sig` to `pid`. Returns `Ok(SignalOutcome::Gone)` for "no such
/// process" and "permission denied" rather than an error, per spec section
/// 4.4.6 / 7; other OS errors propagate.
pub fn send_signal(pid: u32, sig: Sig) -> io::Result<SignalOutcome> {
    imp::send_signal(pid, sig)
}

/// Whether delivering `sig` via the OS signal/console mechanism is safe on
/// this platform. On Windows, INT/TERM are a no-op (spec section 4.4.6):
/// delivering them can kill the process mid-handler and break process-tree
/// bookkeeping, so the supervisor must not attempt it there.
pub fn can_send_console_signal(sig: Sig) -> bool {
    if is_windows() {
        !matches!(sig, Sig::Int | Sig::Term)
    } else {
        true
    }
}

/// Recursively enumerate the live descendants of `pid` (children, their
/// children, ...). Returns an empty vector when process introspection is
/// unavailable on this platform — callers must treat that as "skip
/// descendant teardown", never as an error (spec section 6).
pub fn descendants(pid: u32) -> Vec<u32> {
    imp::descendants(pid)
}

/// Terminate `pid` and its entire process tree in one logical operation.
/// Used by the Windows kill path (Job Object / `TerminateJobObject`, falling
/// back to a `Toolhelp32Snapshot` walk) and, on Unix, by iterating
/// [`descendants`] and signalling each with `KILL`.
pub fn kill_tree(pid: u32) -> io::Result<()> {
    imp::kill_tree(pid)
}

#[cfg(unix)]
mod imp {
    use super::{Sig, SignalOutcome};
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::io;

    fn to_nix(sig: Sig) -> Signal {
        match sig {
            Sig::Int => Signal::SIGINT,
            Sig::Term => Signal::SIGTERM,
            Sig::Kill => Signal::SIGKILL,
        }
    }

    pub fn send_signal(pid: u32, sig: Sig) -> io::Result<SignalOutcome> {
        match signal::kill(Pid::from_raw(pid as i32), to_nix(sig)) {
            Ok(()) => Ok(SignalOutcome::Sent),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => Ok(SignalOutcome::Gone),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }

    /// Linux-only `/proc` scan; other Unixes have no cheap dependency-free
    /// way to list children, so they report no descendants.
    #[cfg(target_os = "linux")]
    pub fn descendants(root: u32) -> Vec<u32> {
        let mut parent_of: Vec<(u32, u32)> = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let stat_path = entry.path().join("stat");
            let Ok(contents) = std::fs::read_to_string(&stat_path) else {
                continue;
            };
            // Fields are "pid (comm) state ppid ...". `comm` may contain
            // spaces or parens, so split after the last ')'.
            let Some(after_comm) = contents.rsplit_once(')') else {
                continue;
            };
            let rest: Vec<&str> = after_comm.1.split_whitespace().collect();
            // rest[0] = state, rest[1] = ppid
            let Some(ppid_str) = rest.get(1) else {
                continue;
            };
            let Ok(ppid) = ppid_str.parse::<u32>() else {
                continue;
            };
            parent_of.push((pid, ppid));
        }

        let mut to_visit = vec![root];
        let mut found = Vec::new();
        let mut i = 0;
        while i < to_visit.len() {
            let parent = to_visit[i];
            for &(child, ppid) in &parent_of {
                if ppid == parent && !to_visit.contains(&child) {
                    to_visit.push(child);
                    found.push(child);
                }
            }
            i += 1;
        }
        found
    }

    #[cfg(not(target_os = "linux"))]
    pub fn descendants(_root: u32) -> Vec<u32> {
        Vec::new()
    }

    pub fn kill_tree(pid: u32) -> io::Result<()> {
        for child in descendants(pid) {
            let _ = send_signal(child, Sig::Kill);
        }
        send_signal(pid, Sig::Kill).map(|_| ())
    }
}

#[cfg(windows)]
mod imp {
    use super::{Sig, SignalOutcome};
    use std::io;
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
    };
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

    /// Windows has no POSIX signal semantics; `send_signal` only implements
    /// `Kill`, which maps to `TerminateProcess` via [`kill_tree`]. `Int`/`Term`
    /// are unreachable here because [`super::can_send_console_signal`] gates
    /// them out before the supervisor ever calls this function for those.
    pub fn send_signal(pid: u32, sig: Sig) -> io::Result<SignalOutcome> {
        match sig {
            Sig::Kill => kill_tree(pid).map(|_| SignalOutcome::Sent),
            Sig::Int | Sig::Term => Ok(SignalOutcome::Sent),
        }
    }

    pub fn descendants(root: u32) -> Vec<u32> {
        toolhelp_descendants(root)
    }

    pub fn kill_tree(pid: u32) -> io::Result<()> {
        unsafe {
            let proc_handle = match OpenProcess(PROCESS_TERMINATE | PROCESS_SET_QUOTA, false, pid)
            {
                Ok(h) => h,
                // Process is already gone.
                Err(_) => return Ok(()),
            };

            let job = CreateJobObjectW(None, None)
                .map_err(|e| io::Error::other(format!("CreateJobObjectW failed: {e}")))?;

            if AssignProcessToJobObject(job, proc_handle).is_err() {
                let _ = CloseHandle(job);
                let _ = CloseHandle(proc_handle);
                return terminate_tree_fallback(pid);
            }

            let result = TerminateJobObject(job, 1);
            let _ = CloseHandle(proc_handle);
            let _ = CloseHandle(job);
            result.map_err(|e| io::Error::other(format!("TerminateJobObject failed: {e}")))
        }
    }

    fn toolhelp_descendants(root: u32) -> Vec<u32> {
        use windows::Win32::System::Diagnostics::ToolHelp::{
            CreateToolhelp32Snapshot, Process32First, Process32Next, PROCESSENTRY32,
            TH32CS_SNAPPROCESS,
        };
        let mut entries: Vec<(u32, u32)> = Vec::new();
        unsafe {
            let Ok(snapshot) = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) else {
                return Vec::new();
            };
            let mut entry = PROCESSENTRY32 {
                dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                ..Default::default()
            };
            if Process32First(snapshot, &mut entry).is_ok() {
                loop {
                    entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
                    entry = PROCESSENTRY32 {
                        dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                        ..Default::default()
                    };
                    if Process32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
        }

        let mut to_visit = vec![root];
        let mut found = Vec::new();
        let mut i = 0;
        while i < to_visit.len() {
            let parent = to_visit[i];
            for &(child, ppid) in &entries {
                if ppid == parent && !to_visit.contains(&child) {
                    to_visit.push(child);
                    found.push(child);
                }
            }
            i += 1;
        }
        found
    }

    fn terminate_tree_fallback(root_pid: u32) -> io::Result<()> {
        use windows::Win32::System::Threading::{TerminateProcess, OpenProcess as OpenProcessT};
        let mut to_kill = toolhelp_descendants(root_pid);
        to_kill.push(root_pid);
        for pid in to_kill.into_iter().rev() {
            unsafe {
                if let Ok(h) = OpenProcessT(PROCESS_TERMINATE, false, pid) {
                    let _ = TerminateProcess(h, 1);
                    let _ = CloseHandle(h);
                }
            }
        }
        Ok(())
    }
}

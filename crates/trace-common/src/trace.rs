//! Thin ptrace and wait plumbing.
//!
//! Every wrapper logs its failure at debug level and hands the error back:
//! most callers are in the event loop, where a failed ptrace request only
//! means the tracee vanished between the stop and our reaction.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::{
    errno::Errno,
    libc,
    sys::{
        ptrace::{self, Options},
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{execv, fork, setsid, ForkResult, Pid},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("ptrace {request} on {pid} failed")]
    Ptrace {
        request: &'static str,
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("waiting for {pid} failed")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("spawning {program} failed")]
    Spawn {
        program: String,
        #[source]
        source: Errno,
    },
}

/// Options installed on a zygote: report forks and its own exit.
pub const ZYGOTE_OPTIONS: Options = Options::PTRACE_O_TRACEFORK
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Options installed on a freshly stopped zygote child: report thread
/// creation, exec and exit.
pub const CHILD_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

fn ptrace_err(request: &'static str, pid: Pid, source: Errno) -> TraceError {
    log::debug!("ptrace {request} on {pid} failed: {source}");
    TraceError::Ptrace {
        request,
        pid,
        source,
    }
}

pub fn attach(pid: Pid) -> Result<(), TraceError> {
    ptrace::attach(pid).map_err(|source| ptrace_err("ATTACH", pid, source))
}

pub fn set_options(pid: Pid, options: Options) -> Result<(), TraceError> {
    ptrace::setoptions(pid, options).map_err(|source| ptrace_err("SETOPTIONS", pid, source))
}

/// The event message of the current ptrace-stop; for fork events this is the
/// new child's pid.
pub fn event_message(pid: Pid) -> Result<i64, TraceError> {
    ptrace::getevent(pid).map_err(|source| ptrace_err("GETEVENTMSG", pid, source))
}

/// Resume a stopped tracee, optionally delivering a signal.
pub fn resume(pid: Pid, sig: Option<Signal>) -> Result<(), TraceError> {
    ptrace::cont(pid, sig).map_err(|source| ptrace_err("CONT", pid, source))
}

/// Detach a tracee, optionally delivering a signal. Failure means the tracee
/// is already gone.
pub fn detach(pid: Pid, sig: Option<Signal>) -> Result<(), TraceError> {
    ptrace::detach(pid, sig).map_err(|source| ptrace_err("DETACH", pid, source))
}

/// Block until a specific tracee enters its next stop.
pub fn wait_for_stop(pid: Pid) -> Result<(), TraceError> {
    waitpid(pid, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD))
        .map(drop)
        .map_err(|source| TraceError::Wait { pid, source })
}

/// One non-blocking round of wait-for-any-stop with all-threads,
/// not-same-thread-group semantics.
pub fn wait_any() -> nix::Result<WaitStatus> {
    waitpid(
        None,
        Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
    )
}

/// Has this task already entered a waitable stop?
pub fn try_reap_stop(tid: Pid) -> bool {
    matches!(
        waitpid(
            tid,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
        ),
        Ok(status) if status.pid() == Some(tid)
    )
}

/// Directed signal to one thread of a thread group.
pub fn tgkill(tgid: Pid, tid: Pid, sig: Signal) -> nix::Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw(),
            tid.as_raw(),
            sig as libc::c_int,
        )
    };
    Errno::result(res).map(drop)
}

/// Launch `program` with `args`, fully detached: the grandchild execs in its
/// own session while the intermediate child is reaped before returning, so
/// the caller's wait loop never sees either of them.
pub fn spawn_detached(program: &Path, args: &[&str]) -> Result<(), TraceError> {
    let spawn_err = |source| TraceError::Spawn {
        program: program.display().to_string(),
        source,
    };

    // Everything the grandchild needs is allocated before the first fork;
    // past that point only async-signal-safe calls happen.
    let path = CString::new(program.as_os_str().as_bytes()).map_err(|_| spawn_err(Errno::EINVAL))?;
    let mut argv = vec![path.clone()];
    for arg in args {
        argv.push(CString::new(*arg).map_err(|_| spawn_err(Errno::EINVAL))?);
    }

    match unsafe { fork() }.map_err(spawn_err)? {
        ForkResult::Parent { child } => {
            let _ = waitpid(child, None);
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let _ = execv(&path, &argv);
                    unsafe { libc::_exit(127) }
                }
                _ => unsafe { libc::_exit(0) },
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_option_sets_are_disjoint_where_expected() {
        assert!(ZYGOTE_OPTIONS.contains(Options::PTRACE_O_TRACEFORK));
        assert!(ZYGOTE_OPTIONS.contains(Options::PTRACE_O_TRACEEXIT));
        assert!(!ZYGOTE_OPTIONS.contains(Options::PTRACE_O_TRACECLONE));
        assert!(CHILD_OPTIONS.contains(Options::PTRACE_O_TRACECLONE));
        assert!(CHILD_OPTIONS.contains(Options::PTRACE_O_TRACEEXEC));
        assert!(!CHILD_OPTIONS.contains(Options::PTRACE_O_TRACEFORK));
    }

    #[test]
    fn test_tgkill_rejects_dead_thread() {
        // tid 0 is never a valid thread of this process
        let me = nix::unistd::getpid();
        assert!(tgkill(me, Pid::from_raw(-1), Signal::SIGSTOP).is_err());
    }

    #[test]
    fn test_spawn_detached_reaps_intermediate() {
        spawn_detached(Path::new("/bin/true"), &[]).unwrap();
        // no child of ours is left behind for the wait loop to find
        assert_eq!(
            waitpid(None, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }
}

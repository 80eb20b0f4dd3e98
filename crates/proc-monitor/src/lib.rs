//! Process monitor for zygote-forked hide targets.
//!
//! The monitor ptrace-attaches every zygote template process it can find and
//! watches their forks. A forked child is tracked just long enough to see it
//! acquire its own mount namespace; if its command line and uid match the
//! configured hide-list, the child is frozen with `SIGSTOP` and handed to an
//! external hide daemon that sanitises its mount view before resuming it.
//!
//! The whole state machine runs on one dedicated thread (ptrace demands that
//! every request comes from the tracer thread). Instead of async signal
//! handlers the thread multiplexes readiness with `poll` over three
//! descriptors:
//!
//! - a `signalfd` carrying `SIGCHLD`: some tracee stopped,
//! - the inotify descriptor of the [`watcher`]: the package manifest was
//!   rewritten or the application loader was executed,
//! - a command pipe written by [`MonitorHandle`]: the supervisor wants a
//!   uid-map reload or a shutdown.
//!
//! Idle is simply the poll blocking with nothing to report.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::{
        signal::{kill, SigSet, Signal},
        signalfd::{SfdFlags, SignalFd},
    },
    unistd::{pipe2, Pid},
};
use thiserror::Error;
use trace_common::{parsing::procfs, trace, PidSet};

pub mod config;
mod target;
mod tracer;
mod uid_index;
mod watcher;
mod zygote;

pub use config::{HideEntry, HideList, MonitorConfig};

use uid_index::UidIndex;
use watcher::Watcher;
use zygote::ZygoteRegistry;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("inotify initialisation failed")]
    InotifyInit(#[source] Errno),

    #[error("watching {path} failed")]
    Watch {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("signalfd initialisation failed")]
    SignalFd(#[source] Errno),

    #[error("creating the command pipe failed")]
    CommandPipe(#[source] Errno),

    #[error("spawning the monitor thread failed")]
    Thread(#[source] std::io::Error),
}

enum Command {
    UpdateUidMap,
    Shutdown,
}

/// Cheap-to-clone handle used by the supervisor to poke the running monitor.
/// Dropping every handle shuts the monitor down as well.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: Sender<Command>,
    wake: Arc<File>,
}

impl MonitorHandle {
    /// Force a uid-map rebuild outside the watcher cadence.
    pub fn update_uid_map(&self) {
        self.send(Command::UpdateUidMap);
    }

    /// Ask the monitor to release its tracees and exit.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_ok() {
            let _ = (&*self.wake).write(&[0]);
        }
    }
}

/// Which poll entries reported readiness.
struct Ready {
    tracees: bool,
    watches: bool,
    commands: bool,
}

pub struct Monitor {
    pub(crate) config: MonitorConfig,
    pub(crate) uid_index: UidIndex,
    pub(crate) zygotes: ZygoteRegistry,
    /// PIDs announced by a zygote fork event whose life we are following.
    pub(crate) attached: PidSet,
    /// TIDs stopped solely so that their next stop can become a detach.
    pub(crate) detach_pending: PidSet,
    watcher: Watcher,
    signal_fd: SignalFd,
    commands: Receiver<Command>,
    wake_rx: File,
}

impl Monitor {
    /// Start the monitor on its own thread. The returned join handle
    /// resolves once a [`MonitorHandle::shutdown`] was processed (or every
    /// handle was dropped).
    pub fn spawn(config: MonitorConfig) -> Result<(MonitorHandle, JoinHandle<()>), MonitorError> {
        let (tx, rx) = mpsc::channel();
        let (wake_rx, wake_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(MonitorError::CommandPipe)?;
        let monitor = Monitor::new(config, rx, File::from(wake_rx))?;
        let handle = MonitorHandle {
            tx,
            wake: Arc::new(File::from(wake_tx)),
        };
        let join = std::thread::Builder::new()
            .name("proc-monitor".into())
            .spawn(move || monitor.run())
            .map_err(MonitorError::Thread)?;
        Ok((handle, join))
    }

    fn new(
        config: MonitorConfig,
        commands: Receiver<Command>,
        wake_rx: File,
    ) -> Result<Self, MonitorError> {
        let watcher = Watcher::new(&config)?;
        let signal_fd = SignalFd::with_flags(
            &child_signal_set(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .map_err(MonitorError::SignalFd)?;
        let max_pid = procfs::kernel_pid_max();
        Ok(Self {
            config,
            uid_index: UidIndex::default(),
            zygotes: ZygoteRegistry::default(),
            attached: PidSet::with_max_pid(max_pid),
            detach_pending: PidSet::with_max_pid(max_pid),
            watcher,
            signal_fd,
            commands,
            wake_rx,
        })
    }

    /// The monitor loop. Consumes the monitor; returning drops all state.
    fn run(mut self) {
        // SIGCHLD must be blocked on the tracer thread for the signalfd to
        // see it; the supervisor already blocked it process-wide, this
        // covers direct library use.
        if let Err(err) = child_signal_set().thread_block() {
            trace_common::log_error("blocking SIGCHLD failed", err);
            return;
        }

        self.update_uid_map();
        self.scan_zygotes();

        loop {
            self.drain_tracee_events();

            let Some(ready) = self.wait_ready() else {
                continue;
            };
            if ready.tracees {
                self.drain_child_signals();
            }
            if ready.watches {
                let outcome = self.watcher.drain();
                if outcome.reload_uid_map {
                    self.update_uid_map();
                }
                if outcome.rescan_zygotes {
                    self.scan_zygotes();
                }
            }
            if ready.commands && !self.handle_commands() {
                break;
            }
        }

        self.teardown();
    }

    /// Block until a tracee stop, a filesystem notification or a supervisor
    /// command is pending. `None` means the poll was interrupted.
    fn wait_ready(&self) -> Option<Ready> {
        const INTEREST: PollFlags = PollFlags::POLLIN;
        let ready = |fd: &PollFd| {
            fd.revents()
                .is_some_and(|revents| revents.intersects(INTEREST | PollFlags::POLLHUP))
        };

        let mut fds = [
            PollFd::new(self.signal_fd.as_fd(), INTEREST),
            PollFd::new(self.watcher.as_fd(), INTEREST),
            PollFd::new(self.wake_rx.as_fd(), INTEREST),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => Some(Ready {
                tracees: ready(&fds[0]),
                watches: ready(&fds[1]),
                commands: ready(&fds[2]),
            }),
            Err(Errno::EINTR) => None,
            Err(err) => {
                log::debug!("poll failed: {err}");
                None
            }
        }
    }

    /// Consume queued SIGCHLD notifications. They only say "something
    /// stopped"; the wait drain at the top of the loop does the real work.
    fn drain_child_signals(&mut self) {
        while let Ok(Some(_)) = self.signal_fd.read_signal() {}
    }

    /// Returns false when the monitor should shut down.
    fn handle_commands(&mut self) -> bool {
        let mut buf = [0u8; 16];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        loop {
            match self.commands.try_recv() {
                Ok(Command::UpdateUidMap) => self.update_uid_map(),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    /// Rebuild the uid index from the package manifest.
    pub(crate) fn update_uid_map(&mut self) {
        let file = match File::open(&self.config.packages_file) {
            Ok(file) => file,
            Err(err) => {
                log::debug!(
                    "cannot read {}: {err}",
                    self.config.packages_file.display()
                );
                return;
            }
        };
        self.uid_index
            .rebuild(BufReader::new(file), &self.config.hide_list);
        log::debug!("uid map rebuilt, {} uids bound", self.uid_index.len());
    }

    /// Crawl procfs and start tracing any zygote not yet known.
    pub(crate) fn scan_zygotes(&mut self) {
        for pid in zygote::find_zygotes() {
            self.track_zygote(pid);
        }
    }

    fn track_zygote(&mut self, pid: Pid) {
        let Ok(ns) = procfs::get_process_mount_ns(pid) else {
            return;
        };
        // a re-exec only refreshes the stored namespace, no second attach
        if self.zygotes.update(pid, ns) {
            return;
        }
        log::debug!("tracing zygote {pid}");
        match zygote::attach_zygote(pid) {
            Ok(()) => self.zygotes.insert(pid, ns),
            Err(err) => log::debug!("zygote {pid} not attached: {err}"),
        }
    }

    /// Best-effort release of everything still traced, then drop.
    fn teardown(mut self) {
        log::debug!("proc-monitor: cleaning up");
        let zygotes: Vec<Pid> = self.zygotes.pids().collect();
        for pid in zygotes {
            // bring the zygote into a stop so the detach is accepted
            if kill(pid, Signal::SIGSTOP).is_ok() {
                let _ = trace::wait_for_stop(pid);
            }
            let _ = trace::detach(pid, None);
        }
        self.zygotes.clear();
        self.attached.clear();
        self.detach_pending.clear();
        // any tracee missed here is auto-detached when this thread exits
        log::debug!("proc-monitor: terminated");
    }
}

fn child_signal_set() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask
}

#[cfg(test)]
mod test {
    use std::fs;

    use nix::sys::wait::WaitStatus;
    use trace_common::parsing::procfs::MountNs;

    use crate::config::HideEntry;

    use super::*;

    const MANIFEST: &str = r#"<packages>
  <package name="com.example.app" userId="10123">
</packages>"#;

    /// A monitor wired to a throwaway directory, never run. The ptrace
    /// requests its methods issue against made-up pids fail and are logged,
    /// which is exactly what the loop does for vanished processes.
    fn test_monitor(tag: &str) -> (Monitor, MonitorHandle) {
        let dir = std::env::temp_dir().join(format!("proc-monitor-{}-{tag}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let packages_file = dir.join("packages.xml");
        fs::write(&packages_file, MANIFEST).unwrap();
        let app_loader = dir.join("app_process");
        fs::write(&app_loader, []).unwrap();

        let config = MonitorConfig {
            packages_file,
            app_loader,
            hide_daemon: dir.join("hide-daemon"),
            hide_list: [HideEntry::new("com.example.app", "com.example.app")]
                .into_iter()
                .collect(),
        };

        let (tx, rx) = mpsc::channel();
        let (wake_rx, wake_tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let monitor = Monitor::new(config, rx, File::from(wake_rx)).unwrap();
        let handle = MonitorHandle {
            tx,
            wake: Arc::new(File::from(wake_tx)),
        };
        (monitor, handle)
    }

    fn fake_pid() -> Pid {
        // pid_max itself is an exclusive bound for the allocator, so this
        // pid never names a live process yet fits both bitsets
        Pid::from_raw(procfs::kernel_pid_max() as i32)
    }

    #[test]
    fn test_pending_detach_consumes_any_status() {
        let (mut monitor, _handle) = test_monitor("pending-detach");
        let tid = fake_pid();

        monitor.detach_pending.insert(tid);
        monitor.handle_wait_status(WaitStatus::Stopped(tid, Signal::SIGSTOP));
        assert!(!monitor.detach_pending.contains(tid));

        // a thread dying between the tgkill and its stop clears the mark too
        monitor.detach_pending.insert(tid);
        monitor.handle_wait_status(WaitStatus::Exited(tid, 0));
        assert!(!monitor.detach_pending.contains(tid));
    }

    #[test]
    fn test_death_of_a_zygote_empties_its_registration() {
        let (mut monitor, _handle) = test_monitor("zygote-death");
        let zygote = fake_pid();
        monitor.zygotes.insert(zygote, MountNs { dev: 1, ino: 2 });

        // killed hard enough that no exit event was delivered
        monitor.handle_wait_status(WaitStatus::Signaled(zygote, Signal::SIGKILL, false));
        assert!(!monitor.zygotes.contains(zygote));
    }

    #[test]
    fn test_clone_event_for_vanished_child_clears_the_claim() {
        let (mut monitor, _handle) = test_monitor("vanished-child");
        let child = fake_pid();
        monitor.attached.insert(child);

        // cmdline of a nonexistent pid is unreadable: treated as gone
        monitor.handle_wait_status(WaitStatus::PtraceEvent(
            child,
            Signal::SIGTRAP,
            nix::libc::PTRACE_EVENT_CLONE,
        ));
        assert!(!monitor.attached.contains(child));
    }

    #[test]
    fn test_uid_map_rebuild_uses_the_configured_manifest() {
        let (mut monitor, _handle) = test_monitor("uid-map");
        assert!(monitor.uid_index.is_empty());
        monitor.update_uid_map();
        assert_eq!(
            monitor.uid_index.processes(nix::unistd::Uid::from_raw(10123)),
            vec!["com.example.app"]
        );
    }
}

//! The trace-event state machine.
//!
//! Every wait status of every tracee lands here exactly once, and every
//! ptrace-stop is answered with exactly one continue or detach before the
//! next wait round.

use nix::{
    errno::Errno,
    libc,
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};
use trace_common::trace;

use crate::{target::TargetOutcome, Monitor};

impl Monitor {
    /// Reap every pending wait status. `ECHILD` means there is nothing to
    /// monitor right now; the poll in the main loop sleeps until something
    /// shows up.
    pub(crate) fn drain_tracee_events(&mut self) {
        loop {
            match trace::wait_any() {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.handle_wait_status(status),
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::debug!("wait for tracees failed: {err}");
                    break;
                }
            }
        }
    }

    pub(crate) fn handle_wait_status(&mut self, status: WaitStatus) {
        let Some(pid) = status.pid() else { return };

        // A tid we stopped purely to detach it: consume whatever arrived and
        // let go without propagating anything. Death of the tid clears the
        // pending mark the same way.
        if self.detach_pending.contains(pid) {
            self.release(pid);
            return;
        }

        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_trace_event(pid, event),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => {
                // first stop of a newly forked zygote child: arm thread and
                // exec reporting, then let it run up to its clone events
                log::trace!("initial stop of zygote child {pid}");
                let _ = trace::set_options(pid, trace::CHILD_OPTIONS);
                let _ = trace::resume(pid, None);
            }
            WaitStatus::Stopped(pid, sig) => {
                // not caused by us: a transparent observer re-injects
                log::trace!("forwarding signal {sig} to {pid}");
                let _ = trace::resume(pid, Some(sig));
            }
            _ => {
                // exited, signalled or otherwise not a ptrace-stop; a zygote
                // killed hard enough to skip its exit event leaves here too
                self.zygotes.remove(pid);
                self.release(pid);
            }
        }
    }

    fn handle_trace_event(&mut self, pid: Pid, event: i32) {
        if self.zygotes.contains(pid) {
            match event {
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                    if let Ok(message) = trace::event_message(pid) {
                        let child = Pid::from_raw(message as i32);
                        log::trace!("zygote {pid} forked {child}");
                        self.attached.insert(child);
                    }
                    let _ = trace::resume(pid, None);
                }
                libc::PTRACE_EVENT_EXIT => {
                    log::debug!("zygote {pid} is exiting");
                    self.zygotes.remove(pid);
                    self.release(pid);
                }
                _ => {
                    log::debug!("unexpected event {event} from zygote {pid}");
                    self.zygotes.remove(pid);
                    self.release(pid);
                }
            }
        } else {
            match event {
                libc::PTRACE_EVENT_CLONE => {
                    if self.attached.contains(pid) {
                        match self.check_target(pid) {
                            TargetOutcome::Handled => {}
                            TargetOutcome::Release => self.release(pid),
                        }
                    } else {
                        let _ = trace::resume(pid, None);
                    }
                }
                // exec, exit and anything unexpected: none of our business
                _ => self.release(pid),
            }
        }
    }

    /// Drop every claim on a pid and detach it.
    pub(crate) fn release(&mut self, pid: Pid) {
        self.attached.remove(pid);
        self.detach_pending.remove(pid);
        let _ = trace::detach(pid, None);
    }
}

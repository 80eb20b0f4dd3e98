//! Decides whether a freshly cloned zygote child is a hide target and, when
//! it is, freezes it for the hide daemon.

use nix::{
    sys::signal::Signal,
    unistd::{Pid, Uid},
};
use trace_common::{
    parsing::procfs::{self, MountNs},
    trace,
};

use crate::{
    uid_index::UidIndex,
    zygote::{ZygoteRegistry, ZYGOTE_PREFIX},
    Monitor,
};

/// How the trace loop must follow up a target check.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TargetOutcome {
    /// The check detached the process itself; the loop owes nothing.
    Handled,
    /// The pid is none of our business; the loop releases it.
    Release,
}

/// Pure classification of a candidate, separated from the ptrace side
/// effects. The namespace is read lazily: it only matters for actual
/// hide-list matches.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// Another zygote spawned by fork, never a user app.
    ZygoteSpawn,
    /// Not on the hide-list.
    NoMatch,
    /// On the hide-list but still inside a zygote mount namespace.
    NamespaceShared,
    /// Vanished while we were looking.
    Gone,
    /// A hide target with an isolated namespace.
    Hide,
}

fn classify(
    cmdline: &str,
    uid: Uid,
    index: &UidIndex,
    zygotes: &ZygoteRegistry,
    read_ns: impl FnOnce() -> Option<MountNs>,
) -> Verdict {
    if cmdline.starts_with(ZYGOTE_PREFIX) {
        return Verdict::ZygoteSpawn;
    }
    if !index.processes(uid).iter().any(|process| process == cmdline) {
        return Verdict::NoMatch;
    }
    match read_ns() {
        Some(ns) if zygotes.shares_namespace(ns) => Verdict::NamespaceShared,
        Some(_) => Verdict::Hide,
        None => Verdict::Gone,
    }
}

impl Monitor {
    /// Examine a pid that just delivered its first clone event. Every path
    /// out of here drops the `attached` claim one way or another.
    pub(crate) fn check_target(&mut self, pid: Pid) -> TargetOutcome {
        let Ok(cmdline) = procfs::get_process_cmdline_head(pid) else {
            // killed before we could look, nothing to hide
            return TargetOutcome::Release;
        };
        let Ok(uid) = procfs::get_process_owner(pid) else {
            return TargetOutcome::Release;
        };

        let verdict = classify(&cmdline, uid, &self.uid_index, &self.zygotes, || {
            procfs::get_process_mount_ns(pid).ok()
        });
        log::trace!("clone event for {pid} ({cmdline}): {verdict:?}");

        match verdict {
            Verdict::ZygoteSpawn | Verdict::Gone => TargetOutcome::Release,
            Verdict::NoMatch | Verdict::NamespaceShared => {
                // NamespaceShared is not retried: if the runtime ever gives
                // the process its own namespace, a later clone re-enters here
                self.detach_process(pid, None);
                TargetOutcome::Handled
            }
            Verdict::Hide => {
                log::info!("hiding {cmdline} pid={pid} uid={uid}");
                self.detach_process(pid, Some(Signal::SIGSTOP));
                let pid_arg = pid.to_string();
                if let Err(err) =
                    trace::spawn_detached(&self.config.hide_daemon, &[pid_arg.as_str()])
                {
                    trace_common::log_error("launching the hide daemon failed", err);
                }
                TargetOutcome::Handled
            }
        }
    }

    /// Detach a whole thread group. The main thread goes first, optionally
    /// carrying a signal; siblings already in a waitable stop are released
    /// immediately, the rest get a directed SIGSTOP and a pending-detach
    /// mark consumed by the wait loop.
    pub(crate) fn detach_process(&mut self, pid: Pid, sig: Option<Signal>) {
        self.attached.remove(pid);
        let _ = trace::detach(pid, sig);

        let Ok(tasks) = procfs::get_process_tasks(pid) else {
            return;
        };
        for tid in tasks {
            if tid == pid {
                continue;
            }
            if trace::try_reap_stop(tid) {
                let _ = trace::detach(tid, None);
            } else if trace::tgkill(pid, tid, Signal::SIGSTOP).is_ok() {
                self.detach_pending.insert(tid);
            }
            // a tid that is gone before the tgkill needs no pending mark
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use crate::config::{HideEntry, HideList};

    use super::*;

    const MANIFEST: &str = r#"<package name="com.example.app" userId="10123">"#;

    fn index() -> UidIndex {
        let hide_list: HideList = [HideEntry::new("com.example.app", "com.example.app")]
            .into_iter()
            .collect();
        let mut index = UidIndex::default();
        index.rebuild(Cursor::new(MANIFEST), &hide_list);
        index
    }

    fn zygotes() -> ZygoteRegistry {
        let mut registry = ZygoteRegistry::default();
        registry.insert(Pid::from_raw(900), MountNs { dev: 4, ino: 1000 });
        registry
    }

    const APP_UID: u32 = 1_010_123; // user 10, app uid 10123

    #[test]
    fn test_exact_command_line_match_hides() {
        let verdict = classify(
            "com.example.app",
            Uid::from_raw(APP_UID),
            &index(),
            &zygotes(),
            || Some(MountNs { dev: 4, ino: 2000 }),
        );
        assert_eq!(verdict, Verdict::Hide);
    }

    #[test]
    fn test_prefix_or_suffix_match_does_not_hide() {
        for cmdline in ["com.example.ap", "com.example.app2", "om.example.app"] {
            let verdict = classify(
                cmdline,
                Uid::from_raw(APP_UID),
                &index(),
                &zygotes(),
                || Some(MountNs { dev: 4, ino: 2000 }),
            );
            assert_eq!(verdict, Verdict::NoMatch, "{cmdline}");
        }
    }

    #[test]
    fn test_shared_namespace_aborts_the_hide() {
        let verdict = classify(
            "com.example.app",
            Uid::from_raw(APP_UID),
            &index(),
            &zygotes(),
            || Some(MountNs { dev: 4, ino: 1000 }),
        );
        assert_eq!(verdict, Verdict::NamespaceShared);
    }

    #[test]
    fn test_zygote_spawn_is_never_a_target() {
        let verdict = classify(
            "zygote64",
            Uid::from_raw(0),
            &index(),
            &zygotes(),
            || Some(MountNs { dev: 4, ino: 2000 }),
        );
        assert_eq!(verdict, Verdict::ZygoteSpawn);
    }

    #[test]
    fn test_unknown_uid_does_not_hide() {
        let verdict = classify(
            "com.example.app",
            Uid::from_raw(10200),
            &index(),
            &zygotes(),
            || Some(MountNs { dev: 4, ino: 2000 }),
        );
        assert_eq!(verdict, Verdict::NoMatch);
    }

    #[test]
    fn test_vanished_candidate_is_gone() {
        let verdict = classify(
            "com.example.app",
            Uid::from_raw(APP_UID),
            &index(),
            &zygotes(),
            || None,
        );
        assert_eq!(verdict, Verdict::Gone);
    }
}

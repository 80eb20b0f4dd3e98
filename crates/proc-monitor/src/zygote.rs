//! Zygote discovery and the registry of traced zygotes.
//!
//! A zygote is recognised by two properties: its command line begins with
//! the literal `zygote`, and its parent is init. The registry stores the
//! mount namespace identity of every zygote the monitor is attached to;
//! a forked child may be hidden only once its own namespace no longer
//! matches any of them.

use std::collections::HashMap;

use nix::unistd::Pid;
use trace_common::{
    parsing::procfs::{self, MountNs},
    trace::{self, TraceError},
};

/// Command-line prefix shared by every zygote template process.
pub(crate) const ZYGOTE_PREFIX: &str = "zygote";

#[derive(Debug, Default)]
pub(crate) struct ZygoteRegistry {
    map: HashMap<Pid, MountNs>,
}

impl ZygoteRegistry {
    pub fn contains(&self, pid: Pid) -> bool {
        self.map.contains_key(&pid)
    }

    /// Refresh the namespace of an already registered zygote. Returns false
    /// when the pid is unknown (the caller attaches it first).
    pub fn update(&mut self, pid: Pid, ns: MountNs) -> bool {
        match self.map.get_mut(&pid) {
            Some(existing) => {
                *existing = ns;
                true
            }
            None => false,
        }
    }

    pub fn insert(&mut self, pid: Pid, ns: MountNs) {
        self.map.insert(pid, ns);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<MountNs> {
        self.map.remove(&pid)
    }

    /// Is this namespace still shared with a live zygote?
    pub fn shares_namespace(&self, ns: MountNs) -> bool {
        self.map.values().any(|zygote_ns| *zygote_ns == ns)
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.map.keys().copied()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// True when the pid looks like a zygote: init-parented with a command line
/// beginning with [`ZYGOTE_PREFIX`].
fn is_zygote(pid: Pid) -> bool {
    let Ok(cmdline) = procfs::get_process_cmdline_head(pid) else {
        return false;
    };
    if !cmdline.starts_with(ZYGOTE_PREFIX) {
        return false;
    }
    matches!(procfs::get_process_parent_pid(pid), Ok(ppid) if ppid.as_raw() == 1)
}

/// Crawl procfs for candidate zygotes.
pub(crate) fn find_zygotes() -> Vec<Pid> {
    match procfs::get_running_processes() {
        Ok(pids) => pids.into_iter().filter(|pid| is_zygote(*pid)).collect(),
        Err(err) => {
            trace_common::log_error("procfs crawl for zygotes failed", err);
            Vec::new()
        }
    }
}

/// Attach a zygote and arm fork/exit reporting. On success the zygote is
/// running again and owes the registry exactly one detach.
pub(crate) fn attach_zygote(pid: Pid) -> Result<(), TraceError> {
    trace::attach(pid)?;
    if let Err(err) = trace::wait_for_stop(pid).and_then(|()| {
        trace::set_options(pid, trace::ZYGOTE_OPTIONS)
    }) {
        let _ = trace::detach(pid, None);
        return Err(err);
    }
    let _ = trace::resume(pid, None);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn ns(dev: u64, ino: u64) -> MountNs {
        MountNs { dev, ino }
    }

    #[test]
    fn test_update_only_touches_known_pids() {
        let mut registry = ZygoteRegistry::default();
        let pid = Pid::from_raw(100);
        assert!(!registry.update(pid, ns(1, 2)));

        registry.insert(pid, ns(1, 2));
        // a re-exec changes the namespace without a second attach
        assert!(registry.update(pid, ns(1, 3)));
        assert!(registry.shares_namespace(ns(1, 3)));
        assert!(!registry.shares_namespace(ns(1, 2)));
    }

    #[test]
    fn test_shares_namespace_matches_dev_and_inode() {
        let mut registry = ZygoteRegistry::default();
        registry.insert(Pid::from_raw(100), ns(8, 4026531840));
        registry.insert(Pid::from_raw(200), ns(8, 4026531841));

        assert!(registry.shares_namespace(ns(8, 4026531840)));
        assert!(registry.shares_namespace(ns(8, 4026531841)));
        assert!(!registry.shares_namespace(ns(9, 4026531840)));
        assert!(!registry.shares_namespace(ns(8, 4026531842)));
    }

    #[test]
    fn test_remove_forgets_the_namespace() {
        let mut registry = ZygoteRegistry::default();
        let pid = Pid::from_raw(100);
        registry.insert(pid, ns(1, 2));
        assert_eq!(registry.remove(pid), Some(ns(1, 2)));
        assert!(!registry.contains(pid));
        assert!(!registry.shares_namespace(ns(1, 2)));
    }
}

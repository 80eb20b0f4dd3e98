//! Fixed-width bitmap over the kernel PID space.
//!
//! The monitor tracks per-PID state for thousands of short-lived processes;
//! a bitmap gives O(1) membership without allocator traffic. The bound must
//! come from the running kernel (`/proc/sys/kernel/pid_max`), never from a
//! hardcoded constant.

use nix::unistd::Pid;

#[derive(Debug, Clone)]
pub struct PidSet {
    bits: Vec<u64>,
    max_pid: u32,
}

impl PidSet {
    /// Bitmap covering PIDs `0..=max_pid`.
    pub fn with_max_pid(max_pid: u32) -> Self {
        let words = (max_pid as usize + 1).div_ceil(64);
        Self {
            bits: vec![0; words],
            max_pid,
        }
    }

    /// Word index and mask for a pid, or `None` when it falls outside the
    /// covered range (negative or above `max_pid`).
    fn position(&self, pid: Pid) -> Option<(usize, u64)> {
        let raw = pid.as_raw();
        if raw < 0 || raw as u32 > self.max_pid {
            return None;
        }
        Some((raw as usize / 64, 1u64 << (raw as usize % 64)))
    }

    pub fn insert(&mut self, pid: Pid) {
        match self.position(pid) {
            Some((word, mask)) => self.bits[word] |= mask,
            None => log::debug!("pid {pid} outside the bitmap range, ignored"),
        }
    }

    pub fn remove(&mut self, pid: Pid) {
        if let Some((word, mask)) = self.position(pid) {
            self.bits[word] &= !mask;
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.position(pid)
            .is_some_and(|(word, mask)| self.bits[word] & mask != 0)
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut set = PidSet::with_max_pid(32768);
        let pid = Pid::from_raw(1234);
        assert!(!set.contains(pid));
        set.insert(pid);
        assert!(set.contains(pid));
        assert!(!set.contains(Pid::from_raw(1235)));
        set.remove(pid);
        assert!(!set.contains(pid));
    }

    #[test]
    fn test_boundary_pid_is_representable() {
        let mut set = PidSet::with_max_pid(32768);
        let boundary = Pid::from_raw(32768);
        set.insert(boundary);
        assert!(set.contains(boundary));
    }

    #[test]
    fn test_out_of_range_pids_are_ignored() {
        let mut set = PidSet::with_max_pid(100);
        set.insert(Pid::from_raw(101));
        set.insert(Pid::from_raw(-1));
        assert!(!set.contains(Pid::from_raw(101)));
        assert!(!set.contains(Pid::from_raw(-1)));
    }

    #[test]
    fn test_clear() {
        let mut set = PidSet::with_max_pid(1000);
        for raw in [1, 63, 64, 999] {
            set.insert(Pid::from_raw(raw));
        }
        set.clear();
        for raw in [1, 63, 64, 999] {
            assert!(!set.contains(Pid::from_raw(raw)));
        }
    }
}

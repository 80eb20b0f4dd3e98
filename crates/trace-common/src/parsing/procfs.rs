//! Utility functions used to extract data from procfs

use glob::glob;
use nix::{
    sys::stat::{lstat, stat},
    unistd::{Pid, Uid},
};
use std::{fs, io};
use thiserror::Error;

const PID_MAX_FILE: &str = "/proc/sys/kernel/pid_max";

/// Kernel compile-time ceiling for `pid_max`. Used as a fallback when the
/// sysctl cannot be read: oversizing is safe, undersizing is not.
const PID_MAX_LIMIT: u32 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("stat of {path} failed")]
    Stat {
        #[source]
        source: nix::Error,
        path: String,
    },

    #[error("unexpected format in {path}")]
    UnexpectedFormat { path: String },

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Identity of a mount namespace: device and inode of `/proc/<pid>/ns/mnt`.
/// Two processes share a mount table exactly when these pairs are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountNs {
    pub dev: u64,
    pub ino: u64,
}

/// Returns the mount namespace identity of a given process.
pub fn get_process_mount_ns(pid: Pid) -> Result<MountNs, ProcfsError> {
    let path = format!("/proc/{pid}/ns/mnt");
    let st = stat(path.as_str()).map_err(|source| ProcfsError::Stat { source, path })?;
    Ok(MountNs {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    })
}

/// Returns the first element of the NUL separated command line of a given
/// process. For zygote children this is the process name the runtime
/// installed before any application code ran.
pub fn get_process_cmdline_head(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = fs::read(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(cmdline_head(&data))
}

fn cmdline_head(data: &[u8]) -> String {
    let head = data.split(|b| *b == 0).next().unwrap_or_default();
    String::from_utf8_lossy(head).into_owned()
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    let path = format!("/proc/{pid}/stat");
    let data = fs::read_to_string(&path)
        .map_err(|source| ProcfsError::ReadFile { source, path: path.clone() })?;
    parse_stat_ppid(&data).ok_or(ProcfsError::UnexpectedFormat { path })
}

/// Field 4 of `/proc/<pid>/stat`. The comm field may itself contain spaces
/// and parentheses, so counting starts after the last `)`.
fn parse_stat_ppid(data: &str) -> Option<Pid> {
    let fields = &data[data.rfind(')')? + 1..];
    let ppid = fields.split_whitespace().nth(1)?;
    ppid.parse().ok().map(Pid::from_raw)
}

/// Returns the user owning a given process.
pub fn get_process_owner(pid: Pid) -> Result<Uid, ProcfsError> {
    let path = format!("/proc/{pid}");
    let st = lstat(path.as_str()).map_err(|source| ProcfsError::Stat { source, path })?;
    Ok(Uid::from_raw(st.st_uid))
}

/// Returns the thread ids of a given process.
pub fn get_process_tasks(pid: Pid) -> Result<Vec<Pid>, ProcfsError> {
    let path = format!("/proc/{pid}/task");
    let entries =
        fs::read_dir(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
        .map(Pid::from_raw)
        .collect())
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

/// Largest PID the running kernel will allocate. Falls back to the kernel
/// ceiling when the sysctl is unreadable.
pub fn kernel_pid_max() -> u32 {
    fs::read_to_string(PID_MAX_FILE)
        .ok()
        .and_then(|data| data.trim().parse().ok())
        .unwrap_or(PID_MAX_LIMIT)
}

#[cfg(test)]
mod test {
    use nix::unistd::{getpid, getppid, getuid};

    use super::*;

    #[test]
    fn test_cmdline_head() {
        assert_eq!(cmdline_head(b"com.example.app\0extra\0"), "com.example.app");
        assert_eq!(cmdline_head(b"zygote64\0"), "zygote64");
        assert_eq!(cmdline_head(b""), "");
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(
            parse_stat_ppid("1234 (cat) R 77 1234 1234 0 -1"),
            Some(Pid::from_raw(77))
        );
        // comm containing spaces and a closing parenthesis
        assert_eq!(
            parse_stat_ppid("1234 (tricky) name) S 42 1 1 0 -1"),
            Some(Pid::from_raw(42))
        );
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_own_process() {
        let me = getpid();
        assert_eq!(get_process_parent_pid(me).unwrap(), getppid());
        assert_eq!(get_process_owner(me).unwrap(), getuid());
        // the mount namespace of a process is shared with itself
        assert_eq!(
            get_process_mount_ns(me).unwrap(),
            get_process_mount_ns(me).unwrap()
        );
        assert!(get_process_tasks(me).unwrap().contains(&me));
    }

    #[test]
    fn test_kernel_pid_max() {
        let max = kernel_pid_max();
        assert!(max >= 32768);
    }
}

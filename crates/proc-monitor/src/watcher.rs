//! Filesystem-change observer feeding the monitor loop.
//!
//! One inotify descriptor, two concerns: a close-after-write of the package
//! manifest means the uid index is stale, an access of the application
//! loader means an app is starting and a new zygote may exist.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify},
};

use crate::{config::MonitorConfig, MonitorError};

pub(crate) struct Watcher {
    inotify: Inotify,
    manifest_name: OsString,
}

/// What a drained batch of events asks the monitor to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct WatchOutcome {
    pub reload_uid_map: bool,
    pub rescan_zygotes: bool,
}

impl Watcher {
    pub fn new(config: &MonitorConfig) -> Result<Self, MonitorError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(MonitorError::InotifyInit)?;

        let manifest_dir = config.packages_file.parent().unwrap_or(Path::new("/"));
        add_watch(&inotify, manifest_dir, AddWatchFlags::IN_CLOSE_WRITE)?;

        // The loader ships as 32/64 variants on mixed systems; watch both
        // when the 32-bit one exists, the bare path otherwise.
        let loader32 = loader_variant(&config.app_loader, "32");
        if loader32.exists() {
            add_watch(&inotify, &loader32, AddWatchFlags::IN_ACCESS)?;
            let loader64 = loader_variant(&config.app_loader, "64");
            if loader64.exists() {
                add_watch(&inotify, &loader64, AddWatchFlags::IN_ACCESS)?;
            }
        } else {
            add_watch(&inotify, &config.app_loader, AddWatchFlags::IN_ACCESS)?;
        }

        Ok(Self {
            inotify,
            manifest_name: config
                .packages_file
                .file_name()
                .unwrap_or(OsStr::new(""))
                .to_os_string(),
        })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }

    /// Drain pending events. Tolerant of spurious wake-ups: an empty read is
    /// not an error.
    pub fn drain(&mut self) -> WatchOutcome {
        let mut outcome = WatchOutcome::default();
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) if events.is_empty() => break,
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(err) => {
                    log::debug!("reading inotify events failed: {err}");
                    break;
                }
            };
            for event in events {
                if event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
                    if event.name.as_deref() == Some(self.manifest_name.as_os_str()) {
                        outcome.reload_uid_map = true;
                    }
                } else if event.mask.contains(AddWatchFlags::IN_ACCESS) {
                    outcome.rescan_zygotes = true;
                }
            }
        }
        outcome
    }
}

fn add_watch(inotify: &Inotify, path: &Path, mask: AddWatchFlags) -> Result<(), MonitorError> {
    inotify
        .add_watch(path, mask)
        .map(drop)
        .map_err(|source| MonitorError::Watch {
            path: path.to_path_buf(),
            source,
        })
}

fn loader_variant(loader: &Path, suffix: &str) -> PathBuf {
    let mut name = loader.file_name().unwrap_or(OsStr::new("")).to_os_string();
    name.push(suffix);
    loader.with_file_name(name)
}

#[cfg(test)]
mod test {
    use std::fs;

    use crate::config::MonitorConfig;

    use super::*;

    #[test]
    fn test_loader_variant_appends_to_file_name() {
        assert_eq!(
            loader_variant(Path::new("/system/bin/app_process"), "32"),
            Path::new("/system/bin/app_process32")
        );
        assert_eq!(
            loader_variant(Path::new("/system/bin/app_process"), "64"),
            Path::new("/system/bin/app_process64")
        );
    }

    fn test_watcher(tag: &str) -> (Watcher, MonitorConfig) {
        let dir = std::env::temp_dir().join(format!("shade-watcher-{}-{tag}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let packages_file = dir.join("packages.xml");
        fs::write(&packages_file, "<packages>").unwrap();
        let app_loader = dir.join("app_process");
        fs::write(&app_loader, "loader").unwrap();
        let config = MonitorConfig {
            packages_file,
            app_loader,
            hide_daemon: dir.join("hide-daemon"),
            hide_list: Default::default(),
        };
        (Watcher::new(&config).unwrap(), config)
    }

    #[test]
    fn test_spurious_wakeup_reads_nothing() {
        let (mut watcher, _config) = test_watcher("spurious");
        assert_eq!(watcher.drain(), WatchOutcome::default());
    }

    #[test]
    fn test_manifest_rewrite_requests_a_reload() {
        let (mut watcher, config) = test_watcher("manifest");
        fs::write(&config.packages_file, "<packages>\n</packages>").unwrap();
        let outcome = watcher.drain();
        assert!(outcome.reload_uid_map);
    }

    #[test]
    fn test_sibling_file_writes_are_not_a_reload() {
        let (mut watcher, config) = test_watcher("sibling");
        fs::write(
            config.packages_file.with_file_name("packages.xml.tmp"),
            "partial",
        )
        .unwrap();
        assert!(!watcher.drain().reload_uid_map);
    }

    #[test]
    fn test_loader_access_requests_a_rescan() {
        let (mut watcher, config) = test_watcher("loader");
        fs::read(&config.app_loader).unwrap();
        let outcome = watcher.drain();
        assert!(outcome.rescan_zygotes);
    }
}

//! Monitor configuration and the hide-list model.

use std::collections::BTreeSet;
use std::path::PathBuf;

/// Default location of the package manifest the platform rewrites on every
/// package change.
pub const DEFAULT_PACKAGES_FILE: &str = "/data/system/packages.xml";

/// Default application loader. When a `32` variant of this path exists the
/// loader is watched through its `32`/`64` variants instead.
pub const DEFAULT_APP_LOADER: &str = "/system/bin/app_process";

/// A `(package, process)` pair selected for hiding. A package may carry
/// several entries when it declares extra processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HideEntry {
    pub package: String,
    pub process: String,
}

impl HideEntry {
    pub fn new(package: impl Into<String>, process: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            process: process.into(),
        }
    }
}

/// The hide-list is set-unique on the pair and read-only for the whole
/// monitor run.
pub type HideList = BTreeSet<HideEntry>;

/// Paths the monitor watches and the helper it launches.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Package manifest parsed into the uid index.
    pub packages_file: PathBuf,
    /// Application loader binary; every access means an app is starting.
    pub app_loader: PathBuf,
    /// External helper launched with a frozen target pid as its argument.
    pub hide_daemon: PathBuf,
    /// Processes to hide.
    pub hide_list: HideList,
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use proc_monitor::{config, HideEntry, HideList, MonitorConfig};

const DEFAULT_CONFIG_FILE: &str = "/etc/shade/shaded.ini";
const DEFAULT_HIDE_LIST_FILE: &str = "/etc/shade/hide_list";

const MONITOR_SECTION: &str = "monitor";

/// Daemon configuration backed by an `INI` file.
///
/// The `[monitor]` section knows four keys, all optional except
/// `hide_daemon`: `packages_file`, `app_loader`, `hide_daemon` and
/// `hide_list`. The hide-list file itself is line oriented: one
/// `package` or `package process` pair per line, `#` starts a comment.
#[derive(Debug, Clone)]
pub struct ShadedConfig {
    packages_file: PathBuf,
    app_loader: PathBuf,
    hide_daemon: Option<PathBuf>,
    hide_list_file: PathBuf,
}

impl ShadedConfig {
    /// Construct a new [`ShadedConfig`] using the default file. A missing
    /// default file only yields default values; key validation happens in
    /// [`ShadedConfig::monitor_config`].
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
            return Ok(Self::defaults());
        }
        Self::from_config_file(config_file)
    }

    /// Construct a new [`ShadedConfig`] using a custom file.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn defaults() -> Self {
        Self {
            packages_file: PathBuf::from(config::DEFAULT_PACKAGES_FILE),
            app_loader: PathBuf::from(config::DEFAULT_APP_LOADER),
            hide_daemon: None,
            hide_list_file: PathBuf::from(DEFAULT_HIDE_LIST_FILE),
        }
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        let defaults = Self::defaults();
        let section = conf.section(Some(MONITOR_SECTION));
        let path_key = |key: &str| section.and_then(|s| s.get(key)).map(PathBuf::from);

        Ok(Self {
            packages_file: path_key("packages_file").unwrap_or(defaults.packages_file),
            app_loader: path_key("app_loader").unwrap_or(defaults.app_loader),
            hide_daemon: path_key("hide_daemon"),
            hide_list_file: path_key("hide_list").unwrap_or(defaults.hide_list_file),
        })
    }

    /// Resolve into the monitor's own configuration, loading the hide-list.
    pub fn monitor_config(&self) -> Result<MonitorConfig> {
        let hide_daemon = self
            .hide_daemon
            .clone()
            .with_context(|| format!("'hide_daemon' must be set in the [{MONITOR_SECTION}] section"))?;
        Ok(MonitorConfig {
            packages_file: self.packages_file.clone(),
            app_loader: self.app_loader.clone(),
            hide_daemon,
            hide_list: load_hide_list(&self.hide_list_file)?,
        })
    }
}

fn load_hide_list(path: &Path) -> Result<HideList> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Error loading the hide-list from {}", path.display()))?;
    Ok(parse_hide_list(&data))
}

fn parse_hide_list(data: &str) -> HideList {
    let mut list = HideList::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(package) = parts.next() else { continue };
        // a bare package name targets its default process
        let process = parts.next().unwrap_or(package);
        list.insert(HideEntry::new(package, process));
    }
    list
}

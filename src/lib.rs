//! Shade is a root-hiding helper for zygote-based application platforms.
//! At high level it provides two components:
//!
//! - the [`shaded`](crate::shaded) daemon, which monitors every zygote for
//!   forks of hide-listed applications and freezes matching children before
//!   they run any application code
//! - an external *hide daemon* (not part of this repository) that each
//!   frozen target is handed to; it enters the target's mount namespace,
//!   removes the traces of root modifications and resumes it
//!
//! The heavy lifting lives in the [`proc_monitor`] crate; this crate only
//! wires configuration, logging and signals around it.

pub mod cli;
pub mod shaded;

use std::sync::OnceLock;

/// Version string reported by `shaded --version`; debug builds are marked so
/// a stray development binary on a device is recognisable.
pub(crate) fn version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        let mut version = env!("CARGO_PKG_VERSION").to_string();
        if cfg!(debug_assertions) {
            version.push_str("+dev");
        }
        version
    })
}

/// Route the `log` facade to env_logger. The daemon itself only picks the
/// level: info by default, raised by `-v`/`-vv`. A set `RUST_LOG` wins
/// outright, for sessions where someone is debugging a single module.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }
    let level = override_log_level.max(log::Level::Info);
    env_logger::builder()
        .filter_level(level.to_level_filter())
        .init();
}

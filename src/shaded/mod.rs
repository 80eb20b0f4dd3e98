use anyhow::{Context, Result, ensure};
use nix::{
    sys::signal::{SigSet, Signal},
    unistd::geteuid,
};
use proc_monitor::Monitor;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::ShadedOpts;

mod config;

pub use config::ShadedConfig;

/// Block SIGCHLD for the calling thread (and, when called before any thread
/// exists, for everything spawned later). The monitor's signalfd only sees
/// the signal while every thread keeps it blocked.
pub fn block_child_signal() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("Blocking SIGCHLD failed")?;
    Ok(())
}

pub async fn run(options: &ShadedOpts) -> Result<()> {
    log::trace!("Shade Daemon Options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let config = if let Some(custom_file) = &options.config_file {
        ShadedConfig::with_custom_file(custom_file)?
    } else {
        ShadedConfig::new()?
    };

    let monitor_config = config.monitor_config()?;
    if monitor_config.hide_list.is_empty() {
        log::warn!("The hide-list is empty, nothing will ever be hidden");
    }

    log::info!("Starting the process monitor");
    let (monitor, monitor_thread) = Monitor::spawn(monitor_config)?;

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sig_int.recv() => { log::trace!("SIGINT received"); break }
            _ = sig_term.recv() => { log::trace!("SIGTERM received"); break }
            _ = sig_hup.recv() => {
                log::info!("SIGHUP received, reloading the uid map");
                monitor.update_uid_map();
            }
        }
    }

    log::info!("Terminating the process monitor...");
    monitor.shutdown();
    tokio::task::spawn_blocking(move || monitor_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("The monitor thread panicked"))?;

    Ok(())
}

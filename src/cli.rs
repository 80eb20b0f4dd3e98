use clap::{ArgAction, Parser};

/// Command line options of the shade daemon.
#[derive(Parser, Debug, Clone)]
#[clap(name = "shaded")]
#[clap(about = "Zygote process monitor for root hiding")]
#[clap(version = crate::version())]
pub struct ShadedOpts {
    #[clap(long)]
    pub config_file: Option<String>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug
    /// logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from_args() -> ShadedOpts {
    ShadedOpts::parse()
}

pub fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

/// Report a fatal error through the same logger everything else uses, as a
/// single line carrying the whole cause chain. The debug rendering also
/// includes the backtrace, which is only worth the noise when someone asked
/// for it.
pub fn report_error(e: &anyhow::Error) {
    if with_backtrace() {
        log::error!("{e:?}");
    } else {
        log::error!("{e:#}");
    }
}

fn with_backtrace() -> bool {
    log::max_level() >= log::LevelFilter::Debug
        || std::env::var("RUST_BACKTRACE").is_ok_and(|v| v == "1")
}

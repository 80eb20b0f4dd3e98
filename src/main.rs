use shade::cli;

fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    shade::init_logger(cli::log_level_from_verbosity_flag_count(options.verbose));

    // SIGCHLD must be blocked in every thread before the runtime spawns its
    // workers, otherwise tracee stop notifications can be delivered to a
    // worker and discarded instead of reaching the monitor's signalfd.
    if let Err(e) = shade::shaded::block_child_signal() {
        cli::report_error(&e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            cli::report_error(&e.into());
            std::process::exit(1);
        }
    };

    match runtime.block_on(shade::shaded::run(&options)) {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}

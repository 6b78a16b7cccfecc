//! Logging setup. The teacher's binary (`bin/axes.rs`) calls
//! `env_logger::init()` unconditionally and relies on `RUST_LOG`; kiln folds
//! the CLI's own verbosity knobs into the default filter so `-v`/`-d`/`-q`
//! work without the caller having to set an environment variable by hand.
//! `RUST_LOG` still wins when set, via `Builder::from_default_env`.

use crate::cli::Cli;

/// Initializes the global logger. Must only be called from the binary —
/// library code never configures logging for its embedder.
pub fn init(cli: &Cli) {
    let level = if cli.quiet {
        log::LevelFilter::Warn
    } else if cli.debug || cli.verbose >= 2 {
        log::LevelFilter::Trace
    } else if cli.verbose == 1 {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

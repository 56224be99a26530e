//! Tracing setup for the daemon binary and tools.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment filter variable, e.g. `SAFTBUS_LOG=saftbus_rs=debug`.
pub const LOG_ENV: &str = "SAFTBUS_LOG";

/// Install the process-wide subscriber. Call once, from a binary.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

//! Bus daemon: binds the listening socket and drives the event loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use saftbus_rs::config::DaemonConfig;
use saftbus_rs::daemon::Daemon;
use saftbus_rs::telemetry;

#[derive(Parser, Debug)]
#[command(name = "saftbusd", about = "Broker for timing-receiver services", version)]
struct Args {
    /// Bus socket path (overrides the config file and SAFTBUS_SOCKET_PATH).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    telemetry::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!("config: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => DaemonConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            tracing::error!("startup: {err}");
            return ExitCode::FAILURE;
        }
    };
    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

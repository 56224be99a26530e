//! Client side of the bus: connection, proxies and signal demultiplexing.

mod connection;
mod proxy;
mod signal_group;

pub use connection::{ClientConnection, send_quit};
pub use proxy::{DEFAULT_RPC_TIMEOUT_MS, Proxy};
pub use signal_group::{SignalGroup, SignalSink};

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::sockets::SocketError;
use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "cannot connect to bus socket {path:?} (daemon not running, wrong \
         SAFTBUS_SOCKET_PATH, or permissions): {source}"
    )]
    Connect { path: PathBuf, source: SocketError },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("request timed out; it must be considered lost")]
    Timeout,

    #[error("object path {0:?} not found")]
    UnknownObject(String),

    #[error("identity {0} is not known to the daemon")]
    UnknownIdentity(u32),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("another thread is already polling this signal group")]
    PollerBusy,

    #[error("bus connection closed by the daemon")]
    Disconnected,

    #[error("lock poisoned")]
    LockPoisoned,
}

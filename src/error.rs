use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::daemon::DaemonError;
use crate::sockets::SocketError;
use crate::wire::WireError;

/// Boxed error for code that forwards arbitrary failures (source dispatch).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; match on the inner enums for
/// anything beyond propagation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

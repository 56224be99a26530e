//! Daemon side of the bus: listening socket, service container, assembly.

mod container;
mod run;
mod server;
mod service;

pub use container::{
    BOOTSTRAP_IDENTITY, CONTAINER_INTERFACE, ContainerError, DispatchOutcome, FN_QUIT,
    FN_REGISTER_PROXY, FN_UNREGISTER_PROXY, ServiceContainer,
};
pub use run::Daemon;
pub use server::ServerConnection;
pub use service::{CallContext, CallError, Service};

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::sockets::SocketError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot bind listening socket {path:?}: {source}")]
    Bind { path: PathBuf, source: SocketError },

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event_loop;
pub mod sockets;
pub mod telemetry;
pub mod wire;

pub use error::{BoxError, Error};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the bus vocabulary at the crate root for convenience
pub use crate::client::{ClientConnection, ClientError, Proxy, SignalGroup, SignalSink};
pub use crate::daemon::{CallContext, CallError, Daemon, DaemonError, Service, ServiceContainer};
pub use crate::event_loop::{Interest, IoSource, Loop, Source, SourceId, TimeoutSource};
pub use crate::wire::{Deserializer, Serializer, WireError};

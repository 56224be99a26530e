//! The service trait: one entry point keyed by `(interface_no, function_no)`.

use thiserror::Error;

use super::container::ServiceContainer;
use crate::event_loop::Loop;
use crate::wire::{Deserializer, Serializer, WireError};

#[derive(Debug, Error)]
pub enum CallError {
    /// The pair does not resolve to a method; the caller may retry with a
    /// different selector.
    #[error("unknown method ({interface_no}, {function_no})")]
    UnknownMethod { interface_no: u32, function_no: u32 },

    /// The method ran and failed; recoverable for the caller.
    #[error("{0}")]
    Failed(String),

    /// Malformed arguments; fatal for the connection that sent them.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Everything a method body may touch while it runs on the loop thread.
///
/// The container borrow is exclusive for the duration of the call (the
/// called service itself is taken out of the map, so it never aliases).
pub struct CallContext<'a> {
    /// Identity the request addressed.
    pub identity: u32,
    /// Client the request came from.
    pub client_id: u32,
    pub container: &'a mut ServiceContainer,
    /// The loop driving this call; usable for reentrant pumping and for
    /// quit requests. Set mutations are deferred until the call returns.
    pub event_loop: &'a mut Loop,
}

/// An object hosted in the daemon.
///
/// Methods are grouped into named interface vocabularies agreed out of
/// band; requests select them by index pairs. Implementations must not
/// block; long operations belong on the loop as additional sources.
pub trait Service {
    /// Interface vocabularies, indexed by `interface_no`.
    fn interface_names(&self) -> &[String];

    /// Invoke one method. Arguments are consumed from `args` position by
    /// position; the reply payload is accumulated in `reply`.
    fn call(
        &mut self,
        ctx: &mut CallContext<'_>,
        interface_no: u32,
        function_no: u32,
        args: &mut Deserializer,
        reply: &mut Serializer,
    ) -> Result<(), CallError>;
}

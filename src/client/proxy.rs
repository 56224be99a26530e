//! Client-side stand-in for a daemon-hosted service.

use std::sync::Arc;

use tracing::debug;

use super::ClientError;
use super::connection::ClientConnection;
use super::signal_group::SignalGroup;
use crate::daemon::{
    BOOTSTRAP_IDENTITY, CONTAINER_INTERFACE, FN_REGISTER_PROXY, FN_UNREGISTER_PROXY,
};
use crate::wire::{Deserializer, Kind, Serializer};

/// Default per-RPC timeout in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: i32 = 2_000;

/// Resolves an object path to a daemon identity on construction and holds
/// the registration until dropped. Concrete proxies wrap this and translate
/// their typed methods into [`Proxy::call`] selectors.
pub struct Proxy {
    identity: u32,
    client_id: u32,
    signal_group_id: u32,
    connection: Arc<ClientConnection>,
    signal_group: Arc<SignalGroup>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("client_id", &self.client_id)
            .field("signal_group_id", &self.signal_group_id)
            .finish()
    }
}

impl Proxy {
    /// Register with the daemon: hand over the signal-group socket, then
    /// resolve `object_path` through the bootstrap service.
    pub fn connect(
        connection: &Arc<ClientConnection>,
        signal_group: &Arc<SignalGroup>,
        object_path: &str,
    ) -> Result<Proxy, ClientError> {
        // the descriptor goes first so the daemon can bind the most
        // recently handed signal socket when the call below arrives
        connection.send_signal_fd(signal_group.far_fd())?;

        let mut request = Serializer::new();
        request.put_u32(BOOTSTRAP_IDENTITY);
        request.put_u32(CONTAINER_INTERFACE);
        request.put_u32(FN_REGISTER_PROXY);
        request.put_str(object_path);
        let mut reply = connection
            .round_trip(&request, DEFAULT_RPC_TIMEOUT_MS)?
            .ok_or(ClientError::Timeout)?;

        let identity = reply.get_u32()?;
        let client_id = reply.get_u32()?;
        let signal_group_id = reply.get_u32()?;
        if identity == BOOTSTRAP_IDENTITY {
            return Err(ClientError::UnknownObject(object_path.to_string()));
        }
        debug!(identity, client_id, signal_group_id, path = object_path, "proxy registered");
        Ok(Proxy {
            identity,
            client_id,
            signal_group_id,
            connection: Arc::clone(connection),
            signal_group: Arc::clone(signal_group),
        })
    }

    /// Register through the process-wide connection and signal group.
    pub fn connect_default(object_path: &str) -> Result<Proxy, ClientError> {
        Proxy::connect(
            &ClientConnection::global()?,
            &SignalGroup::global()?,
            object_path,
        )
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn signal_group_id(&self) -> u32 {
        self.signal_group_id
    }

    pub fn signal_group(&self) -> &Arc<SignalGroup> {
        &self.signal_group
    }

    /// Invoke `(interface_no, function_no)` with `args` and translate
    /// failure replies: a bare `false` is a stale identity, `false` plus a
    /// reason is a recoverable method error.
    pub fn call(
        &self,
        interface_no: u32,
        function_no: u32,
        args: &Serializer,
        timeout_ms: i32,
    ) -> Result<Deserializer, ClientError> {
        let reply = self.call_raw(interface_no, function_no, args, timeout_ms)?;
        if reply.peek_kind() == Some(Kind::Bool) {
            let mut probe = reply.clone();
            if !probe.get_bool()? {
                return Err(if probe.is_empty() {
                    ClientError::UnknownIdentity(self.identity)
                } else {
                    ClientError::Remote(probe.get_str()?)
                });
            }
        }
        Ok(reply)
    }

    /// Invoke without failure-reply translation, for methods whose own
    /// payload legitimately starts with a boolean.
    pub fn call_raw(
        &self,
        interface_no: u32,
        function_no: u32,
        args: &Serializer,
        timeout_ms: i32,
    ) -> Result<Deserializer, ClientError> {
        let mut request = Serializer::new();
        request.put_u32(self.identity);
        request.put_u32(interface_no);
        request.put_u32(function_no);
        request.append(args);
        self.connection
            .round_trip(&request, timeout_ms)?
            .ok_or(ClientError::Timeout)
    }

    fn unregister(&self) -> Result<bool, ClientError> {
        let mut request = Serializer::new();
        request.put_u32(BOOTSTRAP_IDENTITY);
        request.put_u32(CONTAINER_INTERFACE);
        request.put_u32(FN_UNREGISTER_PROXY);
        request.put_u32(self.identity);
        request.put_u32(self.client_id);
        request.put_u32(self.signal_group_id);
        let mut reply = self
            .connection
            .round_trip(&request, DEFAULT_RPC_TIMEOUT_MS)?
            .ok_or(ClientError::Timeout)?;
        Ok(reply.get_bool()?)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // teardown must survive a daemon that is already gone
        match self.unregister() {
            Ok(true) => {}
            Ok(false) => debug!(identity = self.identity, "proxy was already unregistered"),
            Err(err) => {
                debug!(identity = self.identity, error = %err, "best-effort proxy teardown failed");
            }
        }
    }
}

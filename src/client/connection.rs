//! Process-wide RPC connection to the daemon.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::poll::PollFlags;
use tracing::debug;

use super::ClientError;
use crate::config;
use crate::daemon::{BOOTSTRAP_IDENTITY, CONTAINER_INTERFACE, FN_QUIT};
use crate::sockets;
use crate::wire::{Deserializer, Serializer};

/// Milliseconds granted to the daemon for the initial handshake.
const HANDSHAKE_TIMEOUT_MS: i32 = 5_000;

static GLOBAL: Mutex<Option<Arc<ClientConnection>>> = Mutex::new(None);

/// One connection per process, shared by every proxy.
///
/// The base datagram socket stays open so signal sockets can be handed to
/// the daemon later; the RPC seqpacket carries strictly request/response
/// traffic, serialized through its mutex.
pub struct ClientConnection {
    base: Mutex<OwnedFd>,
    rpc: Mutex<OwnedFd>,
    client_id: u32,
}

impl ClientConnection {
    /// Connect to the daemon, hand over our end of a fresh seqpacket pair
    /// and read back the assigned client id. `None` resolves the socket
    /// through `SAFTBUS_SOCKET_PATH` or the built-in default.
    pub fn connect(path: Option<&Path>) -> Result<Self, ClientError> {
        let path = config::resolve_socket_path(path)?;
        let base =
            sockets::connect_datagram(&path).map_err(|source| ClientError::Connect {
                path: path.clone(),
                source,
            })?;

        let (far, near) = sockets::seqpacket_pair()?;
        let mut hello = Serializer::new();
        hello.put_u32(0); // no id yet, the daemon assigns one
        sockets::send_fd(base.as_fd(), &hello, far.as_fd())?;
        drop(far);

        let revents = sockets::poll_one(near.as_fd(), PollFlags::POLLIN, HANDSHAKE_TIMEOUT_MS)?;
        if !revents.contains(PollFlags::POLLIN) {
            return Err(ClientError::Timeout);
        }
        let mut welcome = sockets::recv_message(near.as_fd())?.ok_or(ClientError::Disconnected)?;
        let client_id = welcome.get_u32()?;
        debug!(client_id, path = %path.display(), "connected to bus");
        Ok(Self {
            base: Mutex::new(base),
            rpc: Mutex::new(near),
            client_id,
        })
    }

    /// The id the daemon assigned to this process.
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Send one request and await its reply. The RPC mutex is held across
    /// the pair so a concurrent thread cannot steal the response. `Ok(None)`
    /// means the timeout was hit; the request must be considered lost.
    pub fn round_trip(
        &self,
        request: &Serializer,
        timeout_ms: i32,
    ) -> Result<Option<Deserializer>, ClientError> {
        let rpc = self.rpc.lock().map_err(|_| ClientError::LockPoisoned)?;

        let revents = sockets::poll_one(rpc.as_fd(), PollFlags::POLLOUT, timeout_ms)?;
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Err(ClientError::Disconnected);
        }
        if !revents.contains(PollFlags::POLLOUT) {
            return Ok(None);
        }
        sockets::send_message(rpc.as_fd(), request)?;

        let revents = sockets::poll_one(rpc.as_fd(), PollFlags::POLLIN, timeout_ms)?;
        if revents.contains(PollFlags::POLLIN) {
            let reply = sockets::recv_message(rpc.as_fd())?.ok_or(ClientError::Disconnected)?;
            return Ok(Some(reply));
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Err(ClientError::Disconnected);
        }
        Ok(None)
    }

    /// Hand one end of a signal-group socket pair to the daemon. The next
    /// `register_proxy` call of this client binds it.
    pub fn send_signal_fd(&self, fd: BorrowedFd<'_>) -> Result<(), ClientError> {
        let base = self.base.lock().map_err(|_| ClientError::LockPoisoned)?;
        let mut tag = Serializer::new();
        tag.put_u32(self.client_id);
        sockets::send_fd(base.as_fd(), &tag, fd)?;
        Ok(())
    }

    /// Process-wide connection, created on first use and replaceable via
    /// [`ClientConnection::set_global`] so tests can substitute instances.
    pub fn global() -> Result<Arc<ClientConnection>, ClientError> {
        let mut slot = GLOBAL.lock().map_err(|_| ClientError::LockPoisoned)?;
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let connection = Arc::new(ClientConnection::connect(None)?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Replace (or clear) the process-wide connection; returns the previous
    /// one.
    pub fn set_global(connection: Option<Arc<ClientConnection>>) -> Option<Arc<ClientConnection>> {
        match GLOBAL.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, connection),
            Err(_) => None,
        }
    }
}

/// Ask the daemon to shut down. Authorisation is socket permissions only.
pub fn send_quit(connection: &ClientConnection, timeout_ms: i32) -> Result<(), ClientError> {
    let mut request = Serializer::new();
    request.put_u32(BOOTSTRAP_IDENTITY);
    request.put_u32(CONTAINER_INTERFACE);
    request.put_u32(FN_QUIT);
    match connection.round_trip(&request, timeout_ms)? {
        Some(_) => Ok(()),
        None => Err(ClientError::Timeout),
    }
}

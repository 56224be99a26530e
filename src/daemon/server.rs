//! Listening socket, fd-handoff handshake and per-client RPC dispatch.
//!
//! The listening socket is a Unix datagram socket used only for descriptor
//! hand-offs: the first datagram of a client carries its end of a fresh
//! seqpacket pair (the RPC socket), later ones carry signal sockets tagged
//! with the already-assigned client id. All RPC flows over the dedicated
//! seqpacket, one request datagram in, one reply datagram out.

use std::cell::RefCell;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::poll::PollFlags;
use tracing::{debug, info, warn};

use super::DaemonError;
use super::container::{DispatchOutcome, ServiceContainer};
use super::service::CallError;
use crate::config::DaemonConfig;
use crate::error::BoxError;
use crate::event_loop::{IoSource, Loop};
use crate::sockets::{self, SocketError};
use crate::wire::{Serializer, WireError};

struct ServerState {
    next_client_id: u32,
}

/// Accepts client attachments and multiplexes their RPC onto the loop.
pub struct ServerConnection {
    socket_path: PathBuf,
}

impl ServerConnection {
    /// Bind the listening socket and register the accept source. Fails when
    /// the path is invalid or already bound (stale sockets block startup by
    /// design).
    pub fn start(
        event_loop: &mut Loop,
        container: Rc<RefCell<ServiceContainer>>,
        config: &DaemonConfig,
    ) -> Result<ServerConnection, DaemonError> {
        config.validate()?;
        let listen_fd =
            sockets::bind_datagram(&config.socket_path).map_err(|source| DaemonError::Bind {
                path: config.socket_path.clone(),
                source,
            })?;
        let permissions = std::fs::Permissions::from_mode(config.socket_mode);
        if let Err(err) = std::fs::set_permissions(&config.socket_path, permissions) {
            warn!(error = %err, "could not apply socket mode");
        }
        info!(path = %config.socket_path.display(), "listening");

        let listen_fd = Rc::new(listen_fd);
        let state = Rc::new(RefCell::new(ServerState { next_client_id: 1 }));
        let source_fd = Rc::clone(&listen_fd);
        event_loop.connect(IoSource::new(
            listen_fd,
            PollFlags::POLLIN,
            move |lp, revents| {
                if !revents.contains(PollFlags::POLLIN) {
                    return Ok(true);
                }
                // a service further up the stack may be pumping the loop
                // while it holds the container; leave the datagram queued
                let Ok(mut container_ref) = container.try_borrow_mut() else {
                    return Ok(true);
                };
                if let Err(err) =
                    handle_listener(lp, &source_fd, &state, &container, &mut container_ref)
                {
                    warn!(error = %err, "handshake datagram rejected");
                }
                Ok(true)
            },
        ));
        Ok(ServerConnection {
            socket_path: config.socket_path.clone(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

fn handle_listener(
    event_loop: &mut Loop,
    listen_fd: &Rc<OwnedFd>,
    state: &Rc<RefCell<ServerState>>,
    container_rc: &Rc<RefCell<ServiceContainer>>,
    container: &mut ServiceContainer,
) -> Result<(), SocketError> {
    let mut msg = sockets::recv_fd(listen_fd.as_fd())?;
    let claimed_id = msg.payload.get_u32()?;
    let Some(fd) = msg.fd.take() else {
        warn!(claimed_id, "datagram without file descriptor ignored");
        return Ok(());
    };
    if claimed_id == 0 {
        attach_client(event_loop, state, container_rc, container, fd)
    } else {
        container.push_signal_fd(claimed_id, fd);
        Ok(())
    }
}

/// Complete the handshake: assign a client id, write it as the first
/// message on the new RPC socket, and register the per-client I/O source.
fn attach_client(
    event_loop: &mut Loop,
    state: &Rc<RefCell<ServerState>>,
    container_rc: &Rc<RefCell<ServiceContainer>>,
    container: &mut ServiceContainer,
    rpc_fd: OwnedFd,
) -> Result<(), SocketError> {
    let client_id = {
        let mut state = state.borrow_mut();
        let id = state.next_client_id;
        state.next_client_id += 1;
        id
    };
    let mut welcome = Serializer::new();
    welcome.put_u32(client_id);
    sockets::send_message(rpc_fd.as_fd(), &welcome)?;
    container.client_attached(client_id);
    info!(client_id, "client attached");

    let rpc_fd = Rc::new(rpc_fd);
    let source_fd = Rc::clone(&rpc_fd);
    let container = Rc::clone(container_rc);
    event_loop.connect(IoSource::new(
        rpc_fd,
        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
        move |lp, revents| client_io(lp, &source_fd, &container, client_id, revents),
    ));
    Ok(())
}

/// One turn of a client's RPC socket: read a request, dispatch it into the
/// container, write the reply. Returning `Ok(false)` retires the source and
/// closes the socket.
fn client_io(
    event_loop: &mut Loop,
    fd: &Rc<OwnedFd>,
    container: &Rc<RefCell<ServiceContainer>>,
    client_id: u32,
    revents: PollFlags,
) -> Result<bool, BoxError> {
    let hangup = revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)
        && !revents.contains(PollFlags::POLLIN);
    if !hangup && !revents.contains(PollFlags::POLLIN) {
        return Ok(true);
    }

    // a reentrant turn while this client's own call is in flight must not
    // touch the container; the event stays pending until the next poll
    let Ok(mut container_ref) = container.try_borrow_mut() else {
        return Ok(true);
    };

    if hangup {
        container_ref.client_detached(client_id);
        info!(client_id, "client hung up");
        return Ok(false);
    }

    let mut args = match sockets::recv_message(fd.as_fd()) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            container_ref.client_detached(client_id);
            info!(client_id, "client closed its socket");
            return Ok(false);
        }
        Err(err) => {
            container_ref.client_detached(client_id);
            warn!(client_id, error = %err, "rpc read failed");
            return Ok(false);
        }
    };

    let header: Result<(u32, u32, u32), WireError> =
        (|| Ok((args.get_u32()?, args.get_u32()?, args.get_u32()?)))();
    let Ok((identity, interface_no, function_no)) = header else {
        warn!(client_id, "malformed request header, dropping client");
        container_ref.client_detached(client_id);
        return Ok(false);
    };

    let mut reply = Serializer::new();
    match container_ref.dispatch_call(
        identity,
        interface_no,
        function_no,
        client_id,
        event_loop,
        &mut args,
        &mut reply,
    ) {
        Ok(DispatchOutcome::Replied) => {}
        Ok(DispatchOutcome::UnknownIdentity) => {
            debug!(client_id, identity, "call to unknown identity");
            reply.clear();
            reply.put_bool(false);
        }
        Err(CallError::UnknownMethod {
            interface_no,
            function_no,
        }) => {
            debug!(client_id, identity, interface_no, function_no, "unknown method");
            reply.clear();
            reply.put_bool(false);
            reply.put_str(&format!("unknown method ({interface_no}, {function_no})"));
        }
        Err(CallError::Failed(reason)) => {
            debug!(client_id, identity, reason = %reason, "method failed");
            reply.clear();
            reply.put_bool(false);
            reply.put_str(&reason);
        }
        Err(CallError::Wire(err)) => {
            warn!(client_id, identity, error = %err, "malformed call payload, dropping client");
            container_ref.client_detached(client_id);
            return Ok(false);
        }
    }

    if let Err(err) = sockets::send_message(fd.as_fd(), &reply) {
        warn!(client_id, error = %err, "reply write failed, dropping client");
        container_ref.client_detached(client_id);
        return Ok(false);
    }
    Ok(true)
}

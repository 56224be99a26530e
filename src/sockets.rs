//! Unix-domain socket plumbing: seqpacket pairs, datagram endpoints and
//! SCM_RIGHTS file-descriptor passing.
//!
//! Every bus message is exactly one seqpacket datagram, so partial reads
//! cannot happen by construction.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    bind, connect, recv, recvmsg, send, sendmsg, socket, socketpair,
};
use thiserror::Error;

use crate::wire::{Deserializer, Serializer, WireError};

/// Upper bound for one framed message (request, reply or signal).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("system call failed: {0}")]
    Sys(#[from] Errno),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer closed the connection")]
    Closed,
}

/// Connected seqpacket pair, one end per side of a channel.
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd), SocketError> {
    Ok(socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

/// Bind the daemon's listening datagram socket. Fails if the path already
/// exists; stale sockets block startup by design.
pub fn bind_datagram(path: &Path) -> Result<OwnedFd, SocketError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    bind(fd.as_raw_fd(), &UnixAddr::new(path)?)?;
    Ok(fd)
}

/// Client end of the listening datagram socket.
pub fn connect_datagram(path: &Path) -> Result<OwnedFd, SocketError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    connect(fd.as_raw_fd(), &UnixAddr::new(path)?)?;
    Ok(fd)
}

/// Write one message as a single datagram, blocking until buffer space is
/// available.
pub fn send_message(fd: BorrowedFd<'_>, msg: &Serializer) -> Result<(), SocketError> {
    check_size(msg)?;
    send(fd.as_raw_fd(), msg.as_bytes(), MsgFlags::MSG_NOSIGNAL)?;
    Ok(())
}

/// Non-blocking variant of [`send_message`]. `Ok(false)` means the peer's
/// buffer is full (slow consumer).
pub fn try_send_message(fd: BorrowedFd<'_>, msg: &Serializer) -> Result<bool, SocketError> {
    check_size(msg)?;
    match send(
        fd.as_raw_fd(),
        msg.as_bytes(),
        MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(_) => Ok(true),
        Err(Errno::EAGAIN) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Read one datagram, blocking. `Ok(None)` means the peer closed its end.
pub fn recv_message(fd: BorrowedFd<'_>) -> Result<Option<Deserializer>, SocketError> {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(Deserializer::new(buf)))
}

/// Non-blocking variant of [`recv_message`]. `Ok(None)` means nothing is
/// queued; a closed peer is an error here because the caller is draining.
pub fn try_recv_message(fd: BorrowedFd<'_>) -> Result<Option<Deserializer>, SocketError> {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    match recv(fd.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
        Ok(0) => Err(SocketError::Closed),
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(Deserializer::new(buf)))
        }
        Err(Errno::EAGAIN) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Send `payload` together with one passed file descriptor (SCM_RIGHTS).
pub fn send_fd(
    fd: BorrowedFd<'_>,
    payload: &Serializer,
    to_pass: BorrowedFd<'_>,
) -> Result<(), SocketError> {
    check_size(payload)?;
    let iov = [IoSlice::new(payload.as_bytes())];
    let fds = [to_pass.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(
        fd.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    Ok(())
}

/// One datagram received on the listening socket.
pub struct FdMessage {
    pub payload: Deserializer,
    /// The passed descriptor, if the sender attached one. Extra descriptors
    /// beyond the first are closed on receipt.
    pub fd: Option<OwnedFd>,
}

/// Receive one datagram that may carry a passed file descriptor.
pub fn recv_fd(fd: BorrowedFd<'_>) -> Result<FdMessage, SocketError> {
    let mut buf = [0u8; 256];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buf = cmsg_space!([RawFd; 2]);
    let msg = recvmsg::<UnixAddr>(
        fd.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;
    let mut passed: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            for raw in raw_fds {
                passed.push(adopt_fd(raw));
            }
        }
    }
    let n = msg.bytes;
    Ok(FdMessage {
        payload: Deserializer::new(buf[..n].to_vec()),
        fd: passed.into_iter().next(),
    })
}

#[allow(unsafe_code)]
fn adopt_fd(raw: RawFd) -> OwnedFd {
    // SAFETY: the descriptor was just created in this process by the
    // SCM_RIGHTS receive path; nothing else owns it yet.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

/// Poll a single descriptor. Returns the reported events, empty on timeout.
pub fn poll_one(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout_ms: i32,
) -> Result<PollFlags, SocketError> {
    let mut pfds = [PollFd::new(fd, events)];
    let n = poll(&mut pfds, poll_timeout(timeout_ms))?;
    if n == 0 {
        return Ok(PollFlags::empty());
    }
    Ok(pfds[0].revents().unwrap_or(PollFlags::empty()))
}

/// Map a millisecond timeout to poll's representation; negative blocks.
pub fn poll_timeout(timeout_ms: i32) -> PollTimeout {
    if timeout_ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
    }
}

fn check_size(msg: &Serializer) -> Result<(), SocketError> {
    if msg.len() > MAX_MESSAGE_BYTES {
        return Err(WireError::MessageTooLarge {
            max: MAX_MESSAGE_BYTES,
            got: msg.len(),
        }
        .into());
    }
    Ok(())
}

//! Data transfer shared by all socket kinds. The socket types only differ in their
//!  preconditions and in how they react to failures, and they express that through
//!  [DataChannel].

use std::io::{self, Read};
use std::mem::MaybeUninit;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::trace;

use crate::error::{SocketError, SocketResult};
use crate::socket::stats::TrafficStats;
use crate::util::readiness::{wait_ready, Interest, Readiness};
use crate::util::timeout::timeout_ms;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TransferOp {
    Send,
    Recv,
}

pub(crate) trait DataChannel {
    /// stream semantics: a zero-length read is the peer's orderly shutdown
    const ZERO_READ_MEANS_CLOSED: bool;

    fn descriptor(&self) -> Option<&Socket>;
    fn stats_mut(&mut self) -> &mut TrafficStats;

    /// Checked after argument validation, e.g. 'must be connected'
    fn ensure_transfer_allowed(&self, op: TransferOp) -> SocketResult<()>;

    /// called after a hard (i.e. non-transient) send or receive error
    fn on_transfer_failure(&mut self) {}
    fn on_peer_closed(&mut self) {}
}

fn open_descriptor<C: DataChannel>(channel: &C, len: usize) -> SocketResult<&Socket> {
    if len == 0 {
        return Err(SocketError::InvalidParam("buffer must not be empty"));
    }
    channel.descriptor()
        .ok_or(SocketError::InvalidParam("socket is closed"))
}

/// Sends a single chunk without retrying short writes. `destination` overrides the default
///  peer and skips the channel's precondition check.
pub(crate) fn send<C: DataChannel>(channel: &mut C, data: &[u8], destination: Option<SocketAddrV4>) -> SocketResult<usize> {
    let socket = open_descriptor(channel, data.len())?;
    if destination.is_none() {
        channel.ensure_transfer_allowed(TransferOp::Send)?;
    }

    let result = loop {
        let r = match destination {
            Some(addr) => socket.send_to_with_flags(data, &SockAddr::from(addr), SEND_FLAGS),
            None => socket.send_with_flags(data, SEND_FLAGS),
        };
        match r {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => break r,
        }
    };
    let fd = socket.as_raw_fd();

    match result {
        Ok(n) => {
            trace!("sent {} of {} bytes on fd {}", n, data.len(), fd);
            channel.stats_mut().record_tx(n);
            Ok(n)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SocketError::WouldBlock),
        Err(e) => {
            channel.on_transfer_failure();
            Err(SocketError::Send(e))
        }
    }
}

fn await_readable(socket: &Socket, timeout: Option<Duration>) -> SocketResult<()> {
    let timeout_ms = timeout_ms(timeout);
    if timeout_ms == 0 {
        return Ok(());
    }
    match wait_ready(socket.as_raw_fd(), Interest::Read, timeout_ms) {
        Ok(Readiness::Ready) => Ok(()),
        Ok(Readiness::TimedOut) => Err(SocketError::Timeout),
        Err(e) => Err(SocketError::Recv(e)),
    }
}

/// Receives into `buf`, waiting for data at most `timeout`. A zero timeout reads right away,
///  so it returns immediately only if the descriptor is non-blocking.
pub(crate) fn recv<C: DataChannel>(channel: &mut C, buf: &mut [u8], timeout: Option<Duration>) -> SocketResult<usize> {
    let socket = open_descriptor(channel, buf.len())?;
    channel.ensure_transfer_allowed(TransferOp::Recv)?;
    await_readable(socket, timeout)?;

    let mut reader = socket;
    let result = loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => break r,
        }
    };
    let fd = socket.as_raw_fd();
    finish_recv(channel, fd, result.map(|n| (n, ())))
        .map(|(n, _)| n)
}

/// Like [recv], but also reports the sender's address.
pub(crate) fn recv_from<C: DataChannel>(channel: &mut C, buf: &mut [u8], timeout: Option<Duration>) -> SocketResult<(usize, SocketAddrV4)> {
    let socket = open_descriptor(channel, buf.len())?;
    channel.ensure_transfer_allowed(TransferOp::Recv)?;
    await_readable(socket, timeout)?;

    // SAFETY: an initialized byte is a valid MaybeUninit<u8>, and recv_from only ever writes
    //  initialized bytes into the buffer
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let result = loop {
        match socket.recv_from(uninit) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => break r,
        }
    };
    let fd = socket.as_raw_fd();

    let result = result.and_then(|(n, addr)| match addr.as_socket_ipv4() {
        Some(source) => Ok((n, source)),
        None => Err(io::Error::new(io::ErrorKind::InvalidData, "received from a non-IPv4 address")),
    });
    finish_recv(channel, fd, result)
}

fn finish_recv<C: DataChannel, T>(channel: &mut C, fd: RawFd, result: io::Result<(usize, T)>) -> SocketResult<(usize, T)> {
    match result {
        Ok((0, _)) if C::ZERO_READ_MEANS_CLOSED => {
            trace!("orderly shutdown by peer on fd {}", fd);
            channel.on_peer_closed();
            Err(SocketError::Closed)
        }
        Ok((n, source)) => {
            trace!("received {} bytes on fd {}", n, fd);
            channel.stats_mut().record_rx(n);
            Ok((n, source))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SocketError::Timeout),
        Err(e) => {
            channel.on_transfer_failure();
            Err(SocketError::Recv(e))
        }
    }
}

/// Sends zero bytes to find out if the connection is still usable. A transient would-block
///  counts as alive.
pub(crate) fn probe_send(socket: &Socket) -> io::Result<()> {
    match socket.send_with_flags(&[], SEND_FLAGS) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

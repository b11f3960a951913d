use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::Socket;
use tracing::debug;

use crate::error::{SocketError, SocketResult};
use crate::socket::channel::{self, DataChannel, TransferOp};
use crate::socket::stats::TrafficStats;

/// One accepted connection, owned by whoever called [crate::socket::stream::StreamSocket::accept].
///  It has no connection state of its own: errors are reported, but nothing is invalidated.
#[derive(Debug)]
pub struct PeerConnection {
    descriptor: Option<Socket>,
    peer_address: SocketAddrV4,
    stats: TrafficStats,
}

impl PeerConnection {
    pub(crate) fn new(descriptor: Socket, peer_address: SocketAddrV4) -> PeerConnection {
        PeerConnection {
            descriptor: Some(descriptor),
            peer_address,
            stats: TrafficStats::default(),
        }
    }

    pub fn send(&mut self, data: &[u8]) -> SocketResult<usize> {
        channel::send(self, data, None)
    }

    pub fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> SocketResult<usize> {
        channel::recv(self, buf, timeout)
    }

    pub fn close(&mut self) -> SocketResult<()> {
        let socket = self.descriptor.take()
            .ok_or(SocketError::InvalidParam("connection is already closed"))?;
        debug!("closing connection to {} on fd {}", self.peer_address, socket.as_raw_fd());
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer_address
    }
    pub fn stats(&self) -> TrafficStats {
        self.stats
    }
    pub fn is_open(&self) -> bool {
        self.descriptor.is_some()
    }
}

impl DataChannel for PeerConnection {
    const ZERO_READ_MEANS_CLOSED: bool = true;

    fn descriptor(&self) -> Option<&Socket> {
        self.descriptor.as_ref()
    }

    fn stats_mut(&mut self) -> &mut TrafficStats {
        &mut self.stats
    }

    fn ensure_transfer_allowed(&self, _op: TransferOp) -> SocketResult<()> {
        Ok(())
    }
}

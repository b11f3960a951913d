use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::{debug, trace, warn};

use crate::error::{SocketError, SocketResult};
use crate::socket::address::parse_endpoint;
use crate::socket::channel::{self, DataChannel, TransferOp};
use crate::socket::connection_state::ConnectionState;
use crate::socket::nonblocking_guard::NonBlockingGuard;
use crate::socket::options::{int_option_bytes, new_stream_descriptor, set_raw_option};
use crate::socket::peer::PeerConnection;
use crate::socket::stats::TrafficStats;
use crate::tuning::TuningProfile;
use crate::util::readiness::{peer_hung_up, wait_ready, Interest, Readiness};
use crate::util::timeout::timeout_ms;

/// A TCP socket that tracks its own connection state. It can act as a listener (bind, listen,
///  accept) or as a client (connect, reconnect), and it can send and receive once connected.
///
/// All waiting is done through readiness polling with the caller's timeout, so the same code
///  works for blocking and for non-blocking descriptors.
#[derive(Debug)]
pub struct StreamSocket {
    descriptor: Option<Socket>,
    local_address: Option<SocketAddrV4>,
    /// recorded on successful connect, and kept after close or failure for [StreamSocket::reconnect]
    remote_endpoint: Option<SocketAddrV4>,
    is_bound: bool,
    state: ConnectionState,
    stats: TrafficStats,
    backlog: Option<i32>,
    profile: TuningProfile,
}

impl StreamSocket {
    pub fn new(profile: TuningProfile) -> SocketResult<StreamSocket> {
        if let Err(e) = profile.validate() {
            warn!("rejecting tuning profile: {}", e);
            return Err(SocketError::InvalidParam("invalid tuning profile"));
        }

        let descriptor = new_stream_descriptor(&profile)?;
        debug!("created stream socket on fd {}", descriptor.as_raw_fd());
        Ok(StreamSocket {
            descriptor: Some(descriptor),
            local_address: None,
            remote_endpoint: None,
            is_bound: false,
            state: ConnectionState::Disconnected,
            stats: TrafficStats::default(),
            backlog: None,
            profile,
        })
    }

    fn open_descriptor(&self) -> SocketResult<&Socket> {
        self.descriptor.as_ref()
            .ok_or(SocketError::InvalidParam("socket is closed"))
    }

    pub fn bind(&mut self, ip: &str, port: u16) -> SocketResult<()> {
        let socket = self.open_descriptor()?;
        if self.state != ConnectionState::Disconnected || self.is_bound {
            return Err(SocketError::InvalidParam("bind requires an unbound, disconnected socket"));
        }
        let addr = parse_endpoint(ip, port)?;

        socket.set_reuse_address(true)
            .map_err(SocketError::option("SO_REUSEADDR"))?;
        socket.bind(&SockAddr::from(addr))
            .map_err(|source| SocketError::Bind { addr, source })?;

        let local = socket.local_addr().ok()
            .and_then(|a| a.as_socket_ipv4())
            .unwrap_or(addr);
        debug!("bound fd {} to {}", socket.as_raw_fd(), local);

        self.local_address = Some(local);
        self.is_bound = true;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> SocketResult<()> {
        let socket = self.open_descriptor()?;
        if !self.is_bound {
            return Err(SocketError::InvalidParam("listen requires a bound socket"));
        }
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(SocketError::InvalidParam("cannot listen on a connected socket"));
        }

        socket.listen(backlog)
            .map_err(SocketError::Listen)?;
        debug!("listening on {:?} with backlog {}", self.local_address, backlog);

        self.state = ConnectionState::Listening;
        self.backlog = Some(backlog);
        Ok(())
    }

    /// Accepts a pending connection, waiting at most `timeout` for one to arrive. A timeout is
    ///  reported as [SocketError::Timeout] and leaves the listener untouched, so this can be
    ///  called in a loop.
    pub fn accept(&mut self, timeout: Option<Duration>) -> SocketResult<PeerConnection> {
        if self.state != ConnectionState::Listening {
            return Err(SocketError::InvalidParam("accept requires a listening socket"));
        }
        let socket = self.open_descriptor()?;

        let timeout_ms = timeout_ms(timeout);
        if timeout_ms != 0 {
            match wait_ready(socket.as_raw_fd(), Interest::Read, timeout_ms) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::TimedOut) => return Err(SocketError::Timeout),
                Err(e) => return Err(SocketError::Accept(e)),
            }
        }

        let (accepted, addr) = match socket.accept() {
            Ok(x) => x,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) => {
                return Err(SocketError::Timeout);
            }
            Err(e) => return Err(SocketError::Accept(e)),
        };

        // dropping `accepted` on any of the following error paths closes it
        if self.profile.wants_nonblocking() {
            accepted.set_nonblocking(true)
                .map_err(SocketError::option("O_NONBLOCK"))?;
        }
        let peer_address = addr.as_socket_ipv4()
            .ok_or_else(|| SocketError::Accept(std::io::Error::new(std::io::ErrorKind::InvalidData, "peer is not IPv4")))?;

        debug!("accepted connection from {} on fd {}", peer_address, accepted.as_raw_fd());
        Ok(PeerConnection::new(accepted, peer_address))
    }

    /// Connects to `ip:port`, waiting at most `timeout` for the handshake to complete.
    ///
    /// After a [SocketError::Timeout] the handshake is still pending on this descriptor, so a
    ///  second `connect` fails with [SocketError::Connect]. Retry with a fresh socket instead:
    ///  [StreamSocket::reconnect] only knows endpoints that were connected successfully before.
    pub fn connect(&mut self, ip: &str, port: u16, timeout: Option<Duration>) -> SocketResult<()> {
        match self.state {
            ConnectionState::Connected => return Err(SocketError::AlreadyConnected),
            ConnectionState::Listening => return Err(SocketError::InvalidParam("cannot connect a listening socket")),
            _ => {}
        }
        self.open_descriptor()?;
        let addr = parse_endpoint(ip, port)?;
        self.connect_to(addr, timeout)
    }

    fn connect_to(&mut self, addr: SocketAddrV4, timeout: Option<Duration>) -> SocketResult<()> {
        let socket = self.descriptor.as_ref()
            .ok_or(SocketError::InvalidParam("socket is closed"))?;

        let guard = NonBlockingGuard::acquire(socket, self.profile.wants_nonblocking())
            .map_err(SocketError::option("O_NONBLOCK"))?;
        self.state = ConnectionState::Connecting;
        trace!("connecting fd {} to {}", socket.as_raw_fd(), addr);

        let outcome = match establish(socket, addr, timeout) {
            Ok(()) => guard.release()
                .map_err(SocketError::option("O_NONBLOCK")),
            Err(e) => {
                drop(guard);
                Err(e)
            }
        };

        match outcome {
            Ok(()) => {
                self.local_address = socket.local_addr().ok()
                    .and_then(|a| a.as_socket_ipv4());
                self.remote_endpoint = Some(addr);
                self.state = ConnectionState::Connected;
                debug!("connected {:?} -> {}", self.local_address, addr);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                debug!("connecting to {} failed: {}", addr, e);
                Err(e)
            }
        }
    }

    /// Re-establishes a connection to the most recently connected endpoint, using a fresh
    ///  descriptor. Does nothing if the socket is still connected - call [StreamSocket::is_connected]
    ///  first to detect a connection that was lost silently.
    pub fn reconnect(&mut self, timeout: Option<Duration>) -> SocketResult<()> {
        let Some(addr) = self.remote_endpoint else {
            return Err(SocketError::NotInitialized("no endpoint to reconnect to"));
        };
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        debug!("reconnecting to {}", addr);
        self.release_descriptor();

        let result = match new_stream_descriptor(&self.profile) {
            Ok(socket) => {
                self.descriptor = Some(socket);
                self.connect_to(addr, timeout)
            }
            Err(e) => Err(e),
        };
        result.map_err(|e| SocketError::Reconnect { addr, source: Box::new(e) })
    }

    /// Checks whether the connection is still usable, correcting the cached state if the
    ///  connection turns out to be broken.
    pub fn is_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let Some(socket) = &self.descriptor else {
            return false;
        };

        let alive = match peer_hung_up(socket.as_raw_fd()) {
            Ok(false) => channel::probe_send(socket).is_ok(),
            Ok(true) | Err(_) => false,
        };
        if !alive {
            debug!("connection to {:?} is broken", self.remote_endpoint);
            self.state = ConnectionState::Disconnected;
        }
        alive
    }

    pub fn send(&mut self, data: &[u8]) -> SocketResult<usize> {
        channel::send(self, data, None)
    }

    pub fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> SocketResult<usize> {
        channel::recv(self, buf, timeout)
    }

    pub fn set_raw_option(&mut self, level: libc::c_int, name: libc::c_int, value: &[u8]) -> SocketResult<()> {
        set_raw_option(self.open_descriptor()?, level, name, value)
    }

    pub fn set_raw_option_int(&mut self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> SocketResult<()> {
        self.set_raw_option(level, name, &int_option_bytes(value))
    }

    pub fn close(&mut self) -> SocketResult<()> {
        if self.descriptor.is_none() {
            return Err(SocketError::InvalidParam("socket is already closed"));
        }
        self.release_descriptor();
        Ok(())
    }

    fn release_descriptor(&mut self) {
        if let Some(socket) = self.descriptor.take() {
            debug!("closing fd {}", socket.as_raw_fd());
        }
        self.state = ConnectionState::Disconnected;
        self.is_bound = false;
        self.backlog = None;
        self.local_address = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
    pub fn stats(&self) -> TrafficStats {
        self.stats
    }
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local_address
    }
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote_endpoint
    }
    pub fn backlog(&self) -> Option<i32> {
        self.backlog
    }
    pub fn is_bound(&self) -> bool {
        self.is_bound
    }
    pub fn is_open(&self) -> bool {
        self.descriptor.is_some()
    }
    pub fn profile(&self) -> &TuningProfile {
        &self.profile
    }
}

/// Runs a non-blocking connect to completion, bounded by `timeout`
fn establish(socket: &Socket, addr: SocketAddrV4, timeout: Option<Duration>) -> SocketResult<()> {
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS)
            || e.kind() == std::io::ErrorKind::WouldBlock
            || e.kind() == std::io::ErrorKind::Interrupted => {}
        Err(source) => return Err(SocketError::Connect { addr, source }),
    }

    match wait_ready(socket.as_raw_fd(), Interest::Write, timeout_ms(timeout)) {
        Ok(Readiness::Ready) => {}
        Ok(Readiness::TimedOut) => return Err(SocketError::Timeout),
        Err(source) => return Err(SocketError::Connect { addr, source }),
    }

    match socket.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(source)) | Err(source) => Err(SocketError::Connect { addr, source }),
    }
}

impl DataChannel for StreamSocket {
    const ZERO_READ_MEANS_CLOSED: bool = true;

    fn descriptor(&self) -> Option<&Socket> {
        self.descriptor.as_ref()
    }

    fn stats_mut(&mut self) -> &mut TrafficStats {
        &mut self.stats
    }

    fn ensure_transfer_allowed(&self, _op: TransferOp) -> SocketResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(SocketError::NotInitialized("socket is not connected"));
        }
        Ok(())
    }

    fn on_transfer_failure(&mut self) {
        debug!("transfer failed - connection to {:?} is considered lost", self.remote_endpoint);
        self.state = ConnectionState::Disconnected;
    }

    fn on_peer_closed(&mut self) {
        debug!("connection closed by {:?}", self.remote_endpoint);
        self.state = ConnectionState::Disconnected;
    }
}

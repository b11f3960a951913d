use std::fmt::{Debug, Formatter};
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::{debug, warn};

use crate::error::{SocketError, SocketResult};
use crate::socket::address::parse_endpoint;
use crate::socket::channel::{self, DataChannel, TransferOp};
use crate::socket::options::{int_option_bytes, new_datagram_descriptor, set_raw_option};
use crate::socket::stats::TrafficStats;
use crate::tuning::TuningProfile;
use crate::util::clock::{Clock, SystemClock};

/// A datagram received by [DatagramSocket::recv_from], borrowing the caller's buffer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceivedDatagram<'a> {
    pub data: &'a [u8],
    pub source: SocketAddrV4,
    /// realtime clock in nanoseconds when the datagram was delivered, 0 if the clock was unavailable
    pub timestamp_ns: u64,
}

impl ReceivedDatagram<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A UDP socket with an optional default peer ('connected' in the datagram sense).
pub struct DatagramSocket {
    descriptor: Option<Socket>,
    local_address: Option<SocketAddrV4>,
    default_peer: Option<SocketAddrV4>,
    is_bound: bool,
    stats: TrafficStats,
    profile: TuningProfile,
    clock: Box<dyn Clock>,
}

impl Debug for DatagramSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("descriptor", &self.descriptor)
            .field("local_address", &self.local_address)
            .field("default_peer", &self.default_peer)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DatagramSocket {
    pub fn new(profile: TuningProfile) -> SocketResult<DatagramSocket> {
        DatagramSocket::with_clock(profile, Box::new(SystemClock))
    }

    pub fn with_clock(profile: TuningProfile, clock: Box<dyn Clock>) -> SocketResult<DatagramSocket> {
        if let Err(e) = profile.validate() {
            warn!("rejecting tuning profile: {}", e);
            return Err(SocketError::InvalidParam("invalid tuning profile"));
        }

        let descriptor = new_datagram_descriptor(&profile)?;
        debug!("created datagram socket on fd {}", descriptor.as_raw_fd());
        Ok(DatagramSocket {
            descriptor: Some(descriptor),
            local_address: None,
            default_peer: None,
            is_bound: false,
            stats: TrafficStats::default(),
            profile,
            clock,
        })
    }

    fn open_descriptor(&self) -> SocketResult<&Socket> {
        self.descriptor.as_ref()
            .ok_or(SocketError::InvalidParam("socket is closed"))
    }

    pub fn bind(&mut self, ip: &str, port: u16) -> SocketResult<()> {
        let socket = self.open_descriptor()?;
        if self.is_bound {
            return Err(SocketError::InvalidParam("socket is already bound"));
        }
        let addr = parse_endpoint(ip, port)?;

        socket.bind(&SockAddr::from(addr))
            .map_err(|source| SocketError::Bind { addr, source })?;
        let local = socket.local_addr().ok()
            .and_then(|a| a.as_socket_ipv4())
            .unwrap_or(addr);
        debug!("bound datagram fd {} to {}", socket.as_raw_fd(), local);

        self.local_address = Some(local);
        self.is_bound = true;
        Ok(())
    }

    /// Sets the default peer for [DatagramSocket::send]. Incoming datagrams from other sources
    ///  are filtered by the OS from then on.
    pub fn connect(&mut self, ip: &str, port: u16) -> SocketResult<()> {
        let socket = self.open_descriptor()?;
        let addr = parse_endpoint(ip, port)?;

        socket.connect(&SockAddr::from(addr))
            .map_err(|source| SocketError::Connect { addr, source })?;
        let local = socket.local_addr().ok()
            .and_then(|a| a.as_socket_ipv4());
        debug!("datagram fd {} now sends to {} by default", socket.as_raw_fd(), addr);

        self.default_peer = Some(addr);
        if local.is_some() {
            self.local_address = local;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.default_peer.is_some()
    }

    /// Sends a datagram to the default peer
    pub fn send(&mut self, data: &[u8]) -> SocketResult<usize> {
        channel::send(self, data, None)
    }

    pub fn send_to(&mut self, data: &[u8], ip: &str, port: u16) -> SocketResult<usize> {
        // checked before parsing so that an empty buffer wins over a bad address
        if data.is_empty() {
            return Err(SocketError::InvalidParam("buffer must not be empty"));
        }
        let destination = parse_endpoint(ip, port)?;
        channel::send(self, data, Some(destination))
    }

    /// Receives a single datagram. An empty datagram is a valid result, not a closed connection.
    pub fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> SocketResult<usize> {
        channel::recv(self, buf, timeout)
    }

    pub fn recv_from<'a>(&mut self, buf: &'a mut [u8], timeout: Option<Duration>) -> SocketResult<ReceivedDatagram<'a>> {
        let (n, source) = channel::recv_from(self, buf, timeout)?;
        let timestamp_ns = self.clock.realtime_nanos().unwrap_or(0);
        Ok(ReceivedDatagram {
            data: &buf[..n],
            source,
            timestamp_ns,
        })
    }

    pub fn set_raw_option(&mut self, level: libc::c_int, name: libc::c_int, value: &[u8]) -> SocketResult<()> {
        set_raw_option(self.open_descriptor()?, level, name, value)
    }

    pub fn set_raw_option_int(&mut self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> SocketResult<()> {
        self.set_raw_option(level, name, &int_option_bytes(value))
    }

    pub fn close(&mut self) -> SocketResult<()> {
        let socket = self.descriptor.take()
            .ok_or(SocketError::InvalidParam("socket is already closed"))?;
        debug!("closing datagram fd {}", socket.as_raw_fd());
        self.is_bound = false;
        self.default_peer = None;
        Ok(())
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local_address
    }
    pub fn default_peer(&self) -> Option<SocketAddrV4> {
        self.default_peer
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

impl DataChannel for DatagramSocket {
    const ZERO_READ_MEANS_CLOSED: bool = false;

    fn descriptor(&self) -> Option<&Socket> {
        self.descriptor.as_ref()
    }

    fn stats_mut(&mut self) -> &mut TrafficStats {
        &mut self.stats
    }

    fn ensure_transfer_allowed(&self, op: TransferOp) -> SocketResult<()> {
        if op == TransferOp::Send && self.default_peer.is_none() {
            return Err(SocketError::NotInitialized("no default peer - use send_to or connect first"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;
    use rstest::rstest;
    use crate::error::ErrorKind;
    use crate::util::clock::MockClock;
    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_millis(1000));

    fn bound_receiver(profile: TuningProfile) -> (DatagramSocket, u16) {
        let mut receiver = DatagramSocket::new(profile).unwrap();
        receiver.bind("127.0.0.1", 0).unwrap();
        let port = receiver.local_addr().unwrap().port();
        (receiver, port)
    }

    #[test]
    fn test_send_requires_default_peer() {
        let mut socket = DatagramSocket::new(TuningProfile::default()).unwrap();
        assert!(!socket.is_connected());
        assert_eq!(socket.send(b"abc").unwrap_err().kind(), ErrorKind::NotInitialized);
        assert_eq!(socket.send(b"").unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(socket.stats(), TrafficStats::default());
    }

    #[test]
    fn test_bind_twice() {
        let (mut receiver, _) = bound_receiver(TuningProfile::default());
        assert!(receiver.is_bound());
        assert_eq!(receiver.bind("127.0.0.1", 0).unwrap_err().kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn test_empty_buffer_reported_before_address() {
        let mut socket = DatagramSocket::new(TuningProfile::default()).unwrap();
        assert!(matches!(socket.send_to(b"", "not an address", 1), Err(SocketError::InvalidParam(_))));
        assert!(matches!(socket.send_to(b"x", "not an address", 1), Err(SocketError::InvalidAddress(_))));
    }

    #[test]
    fn test_invalid_address() {
        let mut socket = DatagramSocket::new(TuningProfile::default()).unwrap();
        assert_eq!(socket.connect("no.such.host", 1).unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(socket.send_to(b"x", "300.1.1.1", 1).unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(socket.bind("", 1).unwrap_err().kind(), ErrorKind::InvalidParam);
    }

    #[rstest]
    #[case::polling(TuningProfile::default())]
    #[case::blocking(TuningProfile::conservative())]
    fn test_recv_timeout(#[case] profile: TuningProfile) {
        let (mut receiver, _) = bound_receiver(profile);
        let mut buf = [0u8; 16];
        assert_eq!(receiver.recv(&mut buf, Some(Duration::from_millis(10))).unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(receiver.recv_from(&mut buf, Some(Duration::from_millis(10))).unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(receiver.stats().rx_packets, 0);
    }

    #[test]
    fn test_zero_timeout_on_polling_socket() {
        let (mut receiver, _) = bound_receiver(TuningProfile::default());
        let mut buf = [0u8; 16];
        assert_eq!(receiver.recv(&mut buf, Some(Duration::ZERO)).unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[rstest]
    #[case::polling(TuningProfile::default())]
    // 4 KiB receive buffers cannot hold the whole burst
    #[case::blocking(TuningProfile { buffer_size: 0, ..TuningProfile::conservative() })]
    fn test_round_trip(#[case] profile: TuningProfile) {
        const NUM_DATAGRAMS: usize = 32;
        const SIZE: usize = 64;

        let (mut receiver, port) = bound_receiver(profile.clone());
        let mut sender = DatagramSocket::new(profile).unwrap();
        sender.connect("127.0.0.1", port).unwrap();
        assert!(sender.is_connected());
        let sender_addr = sender.local_addr().unwrap();

        for i in 0..NUM_DATAGRAMS {
            assert_eq!(sender.send(&[i as u8; SIZE]).unwrap(), SIZE);
        }

        let mut buf = [0u8; 1500];
        let mut last_timestamp = 0;
        for i in 0..NUM_DATAGRAMS {
            let datagram = receiver.recv_from(&mut buf, TIMEOUT).unwrap();
            assert_eq!(datagram.len(), SIZE);
            assert!(datagram.data.iter().all(|&b| b == i as u8));
            assert_eq!(datagram.source, sender_addr);
            assert!(datagram.timestamp_ns >= last_timestamp);
            last_timestamp = datagram.timestamp_ns;
        }

        assert_eq!(sender.stats(), TrafficStats { tx_packets: 32, tx_bytes: 32 * 64, ..Default::default() });
        assert_eq!(receiver.stats(), TrafficStats { rx_packets: 32, rx_bytes: 32 * 64, ..Default::default() });
    }

    #[test]
    fn test_send_to_without_connect() {
        let (mut receiver, port) = bound_receiver(TuningProfile::default());
        let mut sender = DatagramSocket::new(TuningProfile::default()).unwrap();
        assert_eq!(sender.send_to(b"hello", "127.0.0.1", port).unwrap(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(receiver.recv(&mut buf, TIMEOUT).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(sender.stats().tx_bytes, 5);
        assert!(!sender.is_connected());
    }

    #[test]
    fn test_empty_datagram_is_not_closed() {
        let (mut receiver, port) = bound_receiver(TuningProfile::default());
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[], ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(receiver.recv(&mut buf, TIMEOUT).unwrap(), 0);
        assert_eq!(receiver.stats().rx_packets, 1);
        assert_eq!(receiver.stats().rx_bytes, 0);
    }

    #[rstest]
    #[case::no_clock(None, 0)]
    #[case::clock(Some(1_700_000_000_123_456_789), 1_700_000_000_123_456_789)]
    fn test_capture_timestamp(#[case] clock_value: Option<u64>, #[case] expected: u64) {
        let mut clock = MockClock::new();
        clock.expect_realtime_nanos()
            .return_const(clock_value);

        let mut receiver = DatagramSocket::with_clock(TuningProfile::default(), Box::new(clock)).unwrap();
        receiver.bind("127.0.0.1", 0).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"tick", ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 16];
        let datagram = receiver.recv_from(&mut buf, TIMEOUT).unwrap();
        assert_eq!(datagram.data, b"tick");
        assert_eq!(datagram.timestamp_ns, expected);
    }

    #[test]
    fn test_close() {
        let (mut receiver, _) = bound_receiver(TuningProfile::default());
        receiver.close().unwrap();
        assert!(!receiver.is_open());
        assert!(!receiver.is_bound());

        let mut buf = [0u8; 16];
        assert_eq!(receiver.close().unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(receiver.recv(&mut buf, TIMEOUT).unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(receiver.send_to(b"x", "127.0.0.1", 1).unwrap_err().kind(), ErrorKind::InvalidParam);
        assert_eq!(receiver.set_raw_option_int(libc::SOL_SOCKET, libc::SO_RCVBUF, 4096).unwrap_err().kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn test_raw_option() {
        let mut socket = DatagramSocket::new(TuningProfile::conservative()).unwrap();
        socket.set_raw_option_int(libc::SOL_SOCKET, libc::SO_BROADCAST, 1).unwrap();
        assert_eq!(socket.set_raw_option(libc::SOL_SOCKET, libc::SO_BROADCAST, &[]).unwrap_err().kind(), ErrorKind::InvalidParam);
    }
}

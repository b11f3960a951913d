//! Loopback helpers for socket tests. Everything runs on 127.0.0.1 with ephemeral ports, so
//!  tests can run in parallel.

use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::socket::peer::PeerConnection;
use crate::socket::stream::StreamSocket;
use crate::tuning::TuningProfile;

pub const LOOPBACK: &str = "127.0.0.1";
pub const TEST_TIMEOUT: Option<Duration> = Some(Duration::from_millis(1000));

pub fn is_nonblocking(socket: &impl AsRawFd) -> bool {
    // SAFETY: F_GETFL only reads the descriptor's flags
    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    assert!(flags >= 0, "fcntl failed");
    flags & libc::O_NONBLOCK != 0
}

/// A port that nobody listens on, at least for the moment
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind((LOOPBACK, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn listening_socket(profile: TuningProfile) -> (StreamSocket, u16) {
    let mut listener = StreamSocket::new(profile).unwrap();
    listener.bind(LOOPBACK, 0).unwrap();
    listener.listen(1).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Returns (listener, client, accepted peer), with the client connected to the peer
pub fn connected_pair(profile: TuningProfile) -> (StreamSocket, StreamSocket, PeerConnection) {
    let (mut listener, port) = listening_socket(profile.clone());
    let mut client = StreamSocket::new(profile).unwrap();
    client.connect(LOOPBACK, port, Some(Duration::from_millis(5000))).unwrap();
    let peer = listener.accept(TEST_TIMEOUT).unwrap();
    (listener, client, peer)
}

use std::mem::size_of;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{trace, warn};

use crate::error::{SocketError, SocketResult};
use crate::tuning::TuningProfile;

/// Creates a TCP descriptor with the profile's socket-level options applied. Buffer sizes,
///  SO_KEEPALIVE and the blocking mode must succeed; keepalive timing and TCP_NODELAY are
///  applied on a best-effort basis.
pub(crate) fn new_stream_descriptor(profile: &TuningProfile) -> SocketResult<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(SocketError::SocketCreate)?;

    apply_buffer_sizes(&socket, profile)?;

    if let Some(keepalive) = &profile.tcp_keepalive {
        socket.set_keepalive(true)
            .map_err(SocketError::option("SO_KEEPALIVE"))?;

        let params = TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval)
            .with_retries(keepalive.retries);
        if let Err(e) = socket.set_tcp_keepalive(&params) {
            warn!("could not configure keepalive timing {:?}: {}", keepalive, e);
        }
    }

    if profile.tcp_nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("could not set TCP_NODELAY: {}", e);
        }
    }

    apply_blocking_mode(&socket, profile)?;
    trace!("created stream descriptor {}", socket.as_raw_fd());
    Ok(socket)
}

/// Creates a UDP descriptor with the profile's socket-level options applied.
pub(crate) fn new_datagram_descriptor(profile: &TuningProfile) -> SocketResult<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(SocketError::SocketCreate)?;

    apply_buffer_sizes(&socket, profile)?;

    if profile.enable_timestamps {
        enable_kernel_timestamps(&socket);
    }

    apply_blocking_mode(&socket, profile)?;
    trace!("created datagram descriptor {}", socket.as_raw_fd());
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn enable_kernel_timestamps(socket: &Socket) {
    if let Err(e) = set_raw_option(socket, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, &int_option_bytes(1)) {
        warn!("could not enable SO_TIMESTAMPNS: {}", e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn enable_kernel_timestamps(_socket: &Socket) {}

fn apply_buffer_sizes(socket: &Socket, profile: &TuningProfile) -> SocketResult<()> {
    if profile.buffer_size > 0 {
        socket.set_send_buffer_size(profile.buffer_size)
            .map_err(SocketError::option("SO_SNDBUF"))?;
        socket.set_recv_buffer_size(profile.buffer_size)
            .map_err(SocketError::option("SO_RCVBUF"))?;
    }
    Ok(())
}

fn apply_blocking_mode(socket: &Socket, profile: &TuningProfile) -> SocketResult<()> {
    if profile.wants_nonblocking() {
        socket.set_nonblocking(true)
            .map_err(SocketError::option("O_NONBLOCK"))?;
    }
    Ok(())
}

/// Passes an option through to `setsockopt` unchanged.
pub(crate) fn set_raw_option(socket: &Socket, level: libc::c_int, name: libc::c_int, value: &[u8]) -> SocketResult<()> {
    if value.is_empty() {
        return Err(SocketError::InvalidParam("option value must not be empty"));
    }
    let len = libc::socklen_t::try_from(value.len())
        .map_err(|_| SocketError::InvalidParam("option value too long"))?;

    // SAFETY: value is a live slice of exactly len bytes, and setsockopt only reads from it
    let rc = unsafe {
        libc::setsockopt(socket.as_raw_fd(), level, name, value.as_ptr().cast(), len)
    };
    if rc < 0 {
        return Err(SocketError::SocketOption {
            option: "raw option",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

pub(crate) fn int_option_bytes(value: libc::c_int) -> [u8; size_of::<libc::c_int>()] {
    value.to_ne_bytes()
}

use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Waits for a single descriptor to become readable or writable.
///
/// A negative `timeout_ms` waits indefinitely. Error and hang-up conditions count as 'ready':
///  the subsequent data operation is what reports the actual problem. A wait interrupted by a
///  signal is resumed with whatever time is left.
pub fn wait_ready(fd: RawFd, interest: Interest, timeout_ms: i32) -> io::Result<Readiness> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };

    let started = Instant::now();
    let mut remaining = timeout_ms;
    loop {
        let mut pfd = libc::pollfd { fd, events, revents: 0 };
        // SAFETY: pfd is a valid pollfd for the duration of the call, and we pass a count of 1
        let rc = unsafe { libc::poll(&mut pfd, 1, remaining) };
        match rc {
            0 => {
                trace!("readiness wait on fd {} for {:?} timed out after {} ms", fd, interest, timeout_ms);
                return Ok(Readiness::TimedOut);
            }
            n if n > 0 => {
                if pfd.revents & libc::POLLNVAL != 0 {
                    return Err(io::Error::from_raw_os_error(libc::EBADF));
                }
                return Ok(Readiness::Ready);
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
                if timeout_ms > 0 {
                    let elapsed = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
                    if elapsed >= timeout_ms {
                        return Ok(Readiness::TimedOut);
                    }
                    remaining = timeout_ms - elapsed;
                }
            }
        }
    }
}

/// Zero-timeout check whether the descriptor signals hang-up or a pending error.
pub fn peer_hung_up(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd { fd, events: 0, revents: 0 };
    // SAFETY: see wait_ready
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0)
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::{Duration, Instant};
    use super::*;

    #[test]
    fn test_read_times_out_without_data() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let started = Instant::now();
        assert_eq!(wait_ready(socket.as_raw_fd(), Interest::Read, 20).unwrap(), Readiness::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_read_ready_with_pending_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"x", receiver.local_addr().unwrap()).unwrap();
        assert_eq!(wait_ready(receiver.as_raw_fd(), Interest::Read, 1000).unwrap(), Readiness::Ready);
    }

    #[test]
    fn test_write_ready_immediately() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert_eq!(wait_ready(socket.as_raw_fd(), Interest::Write, 0).unwrap(), Readiness::Ready);
    }

    #[test]
    fn test_no_hang_up_on_fresh_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(!peer_hung_up(socket.as_raw_fd()).unwrap());
    }
}

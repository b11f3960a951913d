use std::io;
use std::os::fd::AsRawFd;

use socket2::Socket;
use tracing::warn;

/// Puts a socket into non-blocking mode for the guard's lifetime, restoring blocking mode when
///  the guard is released or dropped. If the socket is non-blocking already, the guard does
///  nothing at all.
pub(crate) struct NonBlockingGuard<'a> {
    socket: &'a Socket,
    restore_pending: bool,
}

impl<'a> NonBlockingGuard<'a> {
    pub fn acquire(socket: &'a Socket, already_nonblocking: bool) -> io::Result<NonBlockingGuard<'a>> {
        if !already_nonblocking {
            socket.set_nonblocking(true)?;
        }
        Ok(NonBlockingGuard {
            socket,
            restore_pending: !already_nonblocking,
        })
    }

    /// Restores blocking mode, reporting failure to the caller rather than just logging it
    pub fn release(mut self) -> io::Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> io::Result<()> {
        if !self.restore_pending {
            return Ok(());
        }
        self.restore_pending = false;
        self.socket.set_nonblocking(false)
    }
}

impl Drop for NonBlockingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to restore blocking mode on fd {}: {}", self.socket.as_raw_fd(), e);
        }
    }
}

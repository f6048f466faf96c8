//! Non-blocking byte transport.
//!
//! The connection core is written against [`Transport`]: a non-blocking
//! bidirectional byte stream with `WouldBlock` semantics. The event loop
//! decides *when* to call `read`/`write` (readiness is tracked per
//! connection as interest flags); the transport only moves bytes.

use std::io;
use std::net::{Shutdown, TcpStream};

/// A non-blocking bidirectional byte stream.
///
/// `read` returning `Ok(0)` means EOF; `ErrorKind::WouldBlock` from either
/// direction means "try again when ready". `shutdown` sends a FIN in both
/// directions and is idempotent.
pub trait Transport: Send {
    /// Reads into `buf`, returning the byte count. `Ok(0)` is EOF.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when no data is ready; other errors are terminal.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the byte count written.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the socket cannot take more; other errors are
    /// terminal.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts the stream down in both directions, guaranteeing a FIN even
    /// when forked children hold the descriptor. Best effort.
    fn shutdown(&mut self);
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown(&mut self) {
        let _ = std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both);
    }
}

/// Adapts a [`Transport`] to `io::Read`/`io::Write` for codecs (rustls)
/// that drive a standard stream.
pub struct TransportIo<'a>(pub &'a mut dyn Transport);

impl io::Read for TransportIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl io::Write for TransportIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! TLS negotiation.
//!
//! Accepted sockets on a TLS-bearing listener are parked as pending
//! handshakes; the loop drives them on socket readiness (readable, and
//! writable while a flight is queued) through the [`TlsHandshake`] seam. Success yields the negotiated [`TlsInfo`] and an
//! encrypting [`Transport`]; failure releases admission counters and the
//! socket gets a FIN. The default implementation is rustls, driven sans-io
//! with `read_tls`/`process_new_packets`/`write_tls`.

use std::io;
use std::sync::Arc;

use crate::transport::{Transport, TransportIo};

/// Negotiated session parameters recorded on the connection.
///
/// All fields are `None` on plaintext connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol: Option<String>,
    /// Negotiated cipher suite.
    pub cipher: Option<String>,
    /// SNI server name the client sent.
    pub sni: Option<String>,
}

/// Progress of one handshake drive.
#[derive(Debug)]
pub enum HandshakeStatus {
    /// Would block; drive again on the next readable event.
    InProgress,
    /// Handshake finished; call
    /// [`into_transport`](TlsHandshake::into_transport).
    Ready,
    /// Handshake failed; release the socket.
    Failed(String),
}

/// One in-flight handshake owning the pre-crypto socket.
pub trait TlsHandshake: Send {
    /// Drives handshake progress as far as the socket allows.
    fn drive(&mut self) -> HandshakeStatus;

    /// True when flight bytes are waiting for the socket to accept them;
    /// the loop watches write readiness and drives again.
    fn wants_write(&self) -> bool;

    /// Consumes the handshake, yielding the session info and the
    /// encrypting transport. Only valid after [`HandshakeStatus::Ready`].
    fn into_transport(self: Box<Self>) -> (TlsInfo, Box<dyn Transport>);

    /// Shuts the underlying socket down in both directions.
    fn abort(&mut self);
}

/// Per-address TLS context: creates handshakes for accepted sockets.
pub trait TlsAcceptor: Send + Sync {
    /// Begins a handshake over a freshly accepted socket.
    fn begin(&self, transport: Box<dyn Transport>) -> Box<dyn TlsHandshake>;
}

/// [`TlsAcceptor`] backed by a rustls server configuration.
pub struct RustlsAcceptor {
    config: Arc<rustls::ServerConfig>,
}

impl RustlsAcceptor {
    /// Creates an acceptor from a prepared rustls configuration.
    /// Certificate management is the embedder's concern.
    #[must_use]
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }
}

impl TlsAcceptor for RustlsAcceptor {
    fn begin(&self, transport: Box<dyn Transport>) -> Box<dyn TlsHandshake> {
        match rustls::ServerConnection::new(Arc::clone(&self.config)) {
            Ok(conn) => Box::new(RustlsHandshake::Active { conn, transport }),
            Err(e) => Box::new(RustlsHandshake::Doomed {
                transport,
                reason: e.to_string(),
            }),
        }
    }
}

enum RustlsHandshake {
    Active {
        conn: rustls::ServerConnection,
        transport: Box<dyn Transport>,
    },
    Doomed {
        transport: Box<dyn Transport>,
        reason: String,
    },
}

impl TlsHandshake for RustlsHandshake {
    fn wants_write(&self) -> bool {
        match self {
            Self::Active { conn, .. } => conn.wants_write(),
            Self::Doomed { .. } => false,
        }
    }

    fn drive(&mut self) -> HandshakeStatus {
        let (conn, transport) = match self {
            Self::Active { conn, transport } => (conn, transport),
            Self::Doomed { reason, .. } => return HandshakeStatus::Failed(reason.clone()),
        };

        loop {
            while conn.wants_write() {
                match conn.write_tls(&mut TransportIo(transport.as_mut())) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return HandshakeStatus::Failed(e.to_string()),
                }
            }

            if !conn.is_handshaking() {
                return HandshakeStatus::Ready;
            }

            match conn.read_tls(&mut TransportIo(transport.as_mut())) {
                Ok(0) => return HandshakeStatus::Failed("eof during handshake".to_string()),
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        // flush the alert if the socket will take it
                        let _ = conn.write_tls(&mut TransportIo(transport.as_mut()));
                        return HandshakeStatus::Failed(e.to_string());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::InProgress;
                }
                Err(e) => return HandshakeStatus::Failed(e.to_string()),
            }
        }
    }

    fn into_transport(self: Box<Self>) -> (TlsInfo, Box<dyn Transport>) {
        match *self {
            Self::Active { conn, transport } => {
                let info = TlsInfo {
                    protocol: conn.protocol_version().map(|v| format!("{v:?}")),
                    cipher: conn
                        .negotiated_cipher_suite()
                        .map(|c| format!("{:?}", c.suite())),
                    sni: conn.server_name().map(str::to_string),
                };
                (info, Box::new(TlsTransport { conn, inner: transport }))
            }
            Self::Doomed { transport, .. } => (TlsInfo::default(), transport),
        }
    }

    fn abort(&mut self) {
        match self {
            Self::Active { transport, .. } | Self::Doomed { transport, .. } => {
                transport.shutdown();
            }
        }
    }
}

/// Encrypting transport wrapping a completed rustls session.
struct TlsTransport {
    conn: rustls::ServerConnection,
    inner: Box<dyn Transport>,
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match io::Read::read(&mut self.conn.reader(), buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // no plaintext buffered: pull ciphertext
                    let n = self.conn.read_tls(&mut TransportIo(self.inner.as_mut()))?;
                    if n == 0 {
                        return Ok(0);
                    }
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = io::Write::write(&mut self.conn.writer(), buf)?;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut TransportIo(self.inner.as_mut())) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut TransportIo(self.inner.as_mut()));
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_info_is_empty() {
        let info = TlsInfo::default();
        assert_eq!(info.protocol, None);
        assert_eq!(info.cipher, None);
        assert_eq!(info.sni, None);
    }
}

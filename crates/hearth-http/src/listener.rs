//! Bound sockets and the binder contract.
//!
//! The server computes an `address → context` map and hands it to a
//! [`Binder`], which returns bound, non-blocking listeners. The binder is
//! injectable so tests substitute scripted listeners; the default binder
//! uses std sockets with the context's options applied (backlog,
//! reuseaddr, reuseport unless debug, `IPV6_V6ONLY`).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hearth_core::options::Options;

use crate::tls::TlsAcceptor;
use crate::transport::Transport;

/// A bindable/bound address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// True for unix-domain endpoints (exempt from IP-block accounting).
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// The TCP address, when this is one.
    #[must_use]
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Per-address bind context handed to the binder.
#[derive(Clone)]
pub struct SocketContext {
    /// Listen backlog.
    pub backlog: u32,
    /// `SO_REUSEPORT`; enabled except in debug mode.
    pub reuseport: bool,
    /// `SO_REUSEADDR` (Windows has different semantics for it).
    pub reuseaddr: bool,
    /// `IPV6_V6ONLY`; always on so v4 and v6 binds stay independent.
    pub ipv6_only: bool,
    /// TLS context; `None` for plaintext listeners.
    pub tls: Option<Arc<dyn TlsAcceptor>>,
}

impl SocketContext {
    /// Plaintext context derived from server options.
    #[must_use]
    pub fn plaintext(options: &Options) -> Self {
        Self {
            backlog: options.socket_backlog_size(),
            reuseport: !options.debug(),
            reuseaddr: true,
            ipv6_only: true,
            tls: None,
        }
    }

    /// Adds a TLS context.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// True when this listener terminates TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketContext")
            .field("backlog", &self.backlog)
            .field("reuseport", &self.reuseport)
            .field("reuseaddr", &self.reuseaddr)
            .field("ipv6_only", &self.ipv6_only)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A bound, non-blocking listening socket.
pub trait ListenerSocket: Send {
    /// Accepts one connection. `Ok(None)` when accept would block.
    ///
    /// # Errors
    ///
    /// Transient accept errors are returned; the caller logs and keeps the
    /// listener.
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Endpoint)>>;

    /// The bound local endpoint.
    fn local_endpoint(&self) -> &Endpoint;
}

/// Failure binding one endpoint.
#[derive(Debug)]
pub struct BindError {
    /// The endpoint that failed.
    pub endpoint: Endpoint,
    /// The underlying error.
    pub source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to bind {}: {}", self.endpoint, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Produces bound listeners from the address→context map.
pub trait Binder: Send {
    /// Binds every endpoint, or fails on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first [`BindError`]; already-bound listeners are
    /// dropped.
    fn bind(
        &mut self,
        contexts: &HashMap<Endpoint, SocketContext>,
    ) -> Result<HashMap<Endpoint, Box<dyn ListenerSocket>>, BindError>;
}

/// The default binder: std sockets with context options applied.
#[derive(Debug, Default)]
pub struct StdBinder;

impl Binder for StdBinder {
    fn bind(
        &mut self,
        contexts: &HashMap<Endpoint, SocketContext>,
    ) -> Result<HashMap<Endpoint, Box<dyn ListenerSocket>>, BindError> {
        let mut bound: HashMap<Endpoint, Box<dyn ListenerSocket>> = HashMap::new();
        for (endpoint, context) in contexts {
            let listener = bind_endpoint(endpoint, context).map_err(|source| BindError {
                endpoint: endpoint.clone(),
                source,
            })?;
            bound.insert(endpoint.clone(), listener);
        }
        Ok(bound)
    }
}

fn bind_endpoint(endpoint: &Endpoint, context: &SocketContext) -> io::Result<Box<dyn ListenerSocket>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = sys::bind_tcp(*addr, context)?;
            listener.set_nonblocking(true)?;
            Ok(Box::new(TcpListenerSocket {
                endpoint: endpoint.clone(),
                listener,
            }))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            Ok(Box::new(UnixListenerSocket {
                endpoint: endpoint.clone(),
                listener,
            }))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix-domain sockets are not available on this platform",
        )),
    }
}

struct TcpListenerSocket {
    endpoint: Endpoint,
    listener: std::net::TcpListener,
}

impl ListenerSocket for TcpListenerSocket {
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Endpoint)>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let _ = stream.set_nodelay(true);
                Ok(Some((Box::new(stream), Endpoint::Tcp(peer))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
struct UnixListenerSocket {
    endpoint: Endpoint,
    listener: std::os::unix::net::UnixListener,
}

#[cfg(unix)]
impl ListenerSocket for UnixListenerSocket {
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Endpoint)>> {
        match self.listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true)?;
                // unix peers carry no usable address
                Ok(Some((Box::new(stream), Endpoint::Unix(PathBuf::new()))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
mod sys {
    //! Raw TCP bind honoring backlog/reuseaddr/reuseport/ipv6_only.

    use std::io;
    use std::mem;
    use std::net::SocketAddr;
    use std::os::fd::FromRawFd;

    use super::SocketContext;

    pub fn bind_tcp(addr: SocketAddr, context: &SocketContext) -> io::Result<std::net::TcpListener> {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };

        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let result = configure_and_bind(fd, addr, context);
        if let Err(e) = result {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(unsafe { std::net::TcpListener::from_raw_fd(fd) })
    }

    fn configure_and_bind(
        fd: libc::c_int,
        addr: SocketAddr,
        context: &SocketContext,
    ) -> io::Result<()> {
        unsafe {
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if context.reuseaddr {
            set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        }
        if context.reuseport {
            set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)?;
        }
        if addr.is_ipv6() && context.ipv6_only {
            set_flag(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
        }

        match addr {
            SocketAddr::V4(v4) => {
                let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
                sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
                sockaddr.sin_port = v4.port().to_be();
                sockaddr.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                bind_raw(fd, std::ptr::addr_of!(sockaddr).cast(), mem::size_of_val(&sockaddr))?;
            }
            SocketAddr::V6(v6) => {
                let mut sockaddr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sockaddr.sin6_port = v6.port().to_be();
                sockaddr.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sockaddr.sin6_scope_id = v6.scope_id();
                bind_raw(fd, std::ptr::addr_of!(sockaddr).cast(), mem::size_of_val(&sockaddr))?;
            }
        }

        let backlog = i32::try_from(context.backlog).unwrap_or(i32::MAX);
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_flag(fd: libc::c_int, level: libc::c_int, option: libc::c_int) -> io::Result<()> {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                option,
                std::ptr::addr_of!(one).cast(),
                mem::size_of_val(&one) as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn bind_raw(fd: libc::c_int, sockaddr: *const libc::sockaddr, len: usize) -> io::Result<()> {
        let rc = unsafe { libc::bind(fd, sockaddr, len as libc::socklen_t) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    //! Fallback bind; backlog and reuse options are left to the OS
    //! defaults where std cannot express them.

    use std::io;
    use std::net::SocketAddr;

    use super::SocketContext;

    pub fn bind_tcp(addr: SocketAddr, _context: &SocketContext) -> io::Result<std::net::TcpListener> {
        std::net::TcpListener::bind(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display() {
        let tcp = Endpoint::Tcp("127.0.0.1:8080".parse().unwrap());
        assert_eq!(tcp.to_string(), "127.0.0.1:8080");
        assert!(!tcp.is_unix());

        let unix = Endpoint::Unix(PathBuf::from("/run/hearth.sock"));
        assert_eq!(unix.to_string(), "unix:/run/hearth.sock");
        assert!(unix.is_unix());
    }

    #[test]
    fn plaintext_context_tracks_debug() {
        let opts = Options::new().with_socket_backlog_size(64);
        let ctx = SocketContext::plaintext(&opts);
        assert_eq!(ctx.backlog, 64);
        assert!(ctx.reuseport);
        assert!(!ctx.is_tls());

        let debug_ctx = SocketContext::plaintext(&Options::new().with_debug(true));
        assert!(!debug_ctx.reuseport);
    }

    #[test]
    fn std_binder_binds_ephemeral_port() {
        let endpoint = Endpoint::Tcp("127.0.0.1:0".parse().unwrap());
        let mut contexts = HashMap::new();
        contexts.insert(endpoint.clone(), SocketContext::plaintext(&Options::new()));

        let mut binder = StdBinder;
        let mut bound = binder.bind(&contexts).expect("bind must succeed");
        assert_eq!(bound.len(), 1);

        let listener = bound.get_mut(&endpoint).unwrap();
        // non-blocking accept on an idle listener reports not-ready
        assert!(listener.accept().expect("accept must not error").is_none());
    }
}

//! Connection and request-dispatch core for the hearth HTTP server.
//!
//! The crate wires the pieces of a non-blocking HTTP server around a
//! single-threaded event loop:
//!
//! - admission control ([`admission`]) with global and per-IP-block caps
//! - bound listeners behind an injectable binder ([`listener`])
//! - optional TLS negotiation ([`tls`], rustls-backed)
//! - per-connection state with half-close tracking and a backpressured
//!   write sink ([`client`])
//! - the driver contract ([`driver`]) and an HTTP/1.1 driver ([`h1`])
//! - request dispatch with pre-app fast paths and streamed entity bodies
//!   ([`pipeline`], [`body`])
//! - the filtered response pipeline ([`respond`])
//! - insertion-ordered keep-alive expiry ([`keepalive`])
//! - lifecycle orchestration with observers and graceful drain
//!   ([`server`])
//!
//! The embedding loop owns a [`Server`] and calls its event surface;
//! everything is deterministic under test via the [`testing`] doubles.

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::single_match_else)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod body;
pub mod client;
pub mod driver;
pub mod h1;
pub mod keepalive;
pub mod listener;
pub mod pipeline;
pub mod respond;
pub mod server;
pub mod testing;
pub mod tls;
pub mod transport;

pub use admission::{AdmissionCounters, IpBlock};
pub use body::BodyEmitter;
pub use client::{Client, ConnSink, DrainAction, SinkClosed, WriteGate};
pub use driver::{HttpDriver, ParserEvent, RequestHead, RequestParser, WireError, WireWriter};
pub use h1::Http1Driver;
pub use keepalive::KeepAliveQueue;
pub use listener::{
    BindError, Binder, Endpoint, ListenerSocket, SocketContext, StdBinder,
};
pub use pipeline::{
    AppError, ExactHostSelector, FnHandler, Handler, HandlerFuture, HostSelector, Vhost,
};
pub use respond::{
    FilterError, FilterFactory, FixedResponse, RespondError, ResponseFilter, Responder,
    WriteOutcome,
};
pub use server::{
    ExportDisposer, ExportError, Exported, NoUserSwitcher, Server, StartError, StopError,
    StopWait, UserSwitcher,
};
#[cfg(unix)]
pub use server::PosixUserSwitcher;
pub use tls::{HandshakeStatus, RustlsAcceptor, TlsAcceptor, TlsHandshake, TlsInfo};
pub use transport::{Transport, TransportIo};

// Re-export the core crate for downstream convenience.
pub use hearth_core as core;

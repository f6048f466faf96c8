//! Protocol driver contract.
//!
//! A driver owns the wire details of one HTTP version: its parser turns
//! connection bytes into [`ParserEvent`]s, its writer serializes
//! [`ResponsePart`]s into connection bytes, and it orders the filter chain
//! for a response. The connection core consumes drivers through this
//! contract only.

use std::sync::Arc;

use hearth_core::http::{Headers, HttpVersion};
use hearth_core::options::Options;
use hearth_core::response::{ResponsePart, StatusCode};

use crate::respond::{FilterFactory, ResponseFilter};

/// Parsed request head as surfaced by a driver.
///
/// The method is kept as its raw wire token; mapping (and optional case
/// normalization) is dispatch policy, not driver policy.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Stream id; 0-based counter for HTTP/1.x, wire stream id for HTTP/2.
    pub stream_id: u64,
    /// Raw method token.
    pub method: Vec<u8>,
    /// Request target as received.
    pub uri: String,
    /// Protocol version.
    pub version: HttpVersion,
    /// Request headers.
    pub headers: Headers,
    /// Declared entity size, when the framing knows it.
    pub content_length: Option<usize>,
}

/// Events a driver's parser produces from connection bytes.
#[derive(Debug)]
pub enum ParserEvent {
    /// A complete request with no entity.
    HeadersOnly(RequestHead),
    /// Request headers; entity parts follow on the same stream id.
    EntityHeaders(RequestHead),
    /// One chunk of a request entity.
    EntityPart {
        /// Stream carrying the entity.
        stream_id: u64,
        /// The chunk bytes.
        chunk: Vec<u8>,
    },
    /// The entity on `stream_id` is complete.
    EntityComplete {
        /// Stream carrying the entity.
        stream_id: u64,
    },
    /// The entity crossed the driver's size cap. The stream keeps
    /// receiving; policy lies with the responder.
    SizeWarning {
        /// Stream carrying the entity.
        stream_id: u64,
        /// Bytes received when the cap tripped.
        received: usize,
        /// The cap.
        limit: usize,
    },
    /// Unrecoverable wire error; the connection cannot be reused.
    ParseError {
        /// Status to answer with, when an answer is still possible.
        status: StatusCode,
        /// Human-readable cause.
        message: String,
    },
}

/// Resumable byte sink producing [`ParserEvent`]s.
pub trait RequestParser: Send {
    /// Consumes `bytes`, appending any events they complete.
    fn feed(&mut self, bytes: &[u8], events: &mut Vec<ParserEvent>);
}

/// Failure serializing a response part.
#[derive(Debug)]
pub struct WireError {
    message: String,
}

impl WireError {
    /// Creates a wire error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wire error: {}", self.message)
    }
}

impl std::error::Error for WireError {}

/// Serializer for one response: accepts structured parts in order
/// (`Head`, then body chunks, then `End`) and appends wire bytes to `out`.
pub trait WireWriter: Send {
    /// Serializes one part.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on part-order violations or unserializable
    /// heads.
    fn write_part(&mut self, part: ResponsePart, out: &mut Vec<u8>) -> Result<(), WireError>;
}

/// A pluggable protocol implementation.
pub trait HttpDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &'static str;

    /// Creates a parser for a fresh connection.
    fn parser(&self, options: &Options) -> Box<dyn RequestParser>;

    /// Creates a writer for one response on a request with the given
    /// version. `head_request` suppresses body bytes while keeping
    /// framing headers intact.
    fn writer(&self, version: HttpVersion, head_request: bool) -> Box<dyn WireWriter>;

    /// Orders the filter chain for a response: driver filters first, then
    /// the vhost's.
    fn filters(
        &self,
        _head: &RequestHead,
        vhost: &[Arc<dyn FilterFactory>],
    ) -> Vec<Box<dyn ResponseFilter>> {
        vhost.iter().map(|f| f.create()).collect()
    }

    /// Whether the driver supports server push. Defaults to no.
    fn supports_push(&self) -> bool {
        false
    }
}

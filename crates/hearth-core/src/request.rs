//! The dispatch-view request and its streamed entity body.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use crate::http::{Headers, HttpVersion, Method};

/// Terminal error for a streamed request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// The client disconnected before the body completed.
    Disconnected,
    /// The body exceeded the configured soft cap.
    TooLarge {
        /// Bytes received when the limit tripped.
        received: usize,
        /// The configured limit.
        limit: usize,
    },
    /// Transport-level failure while streaming.
    Io(String),
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected"),
            Self::TooLarge { received, limit } => {
                write!(f, "body too large: {received} bytes exceeds limit of {limit}")
            }
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for BodyError {}

impl BodyError {
    /// True when the termination came from the peer going away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// A streamed request body.
///
/// Chunks arrive from the connection's body emitter as the parser produces
/// them; the application reads them without buffering the whole entity.
pub struct StreamedBody {
    inner: Pin<Box<dyn asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync>>,
    bytes_received: usize,
    expected_size: Option<usize>,
    complete: bool,
}

impl std::fmt::Debug for StreamedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedBody")
            .field("bytes_received", &self.bytes_received)
            .field("expected_size", &self.expected_size)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl StreamedBody {
    /// Wraps a chunk stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync + 'static,
    {
        Self {
            inner: Box::pin(stream),
            bytes_received: 0,
            expected_size: None,
            complete: false,
        }
    }

    /// Wraps a chunk stream with a known Content-Length.
    pub fn with_expected_size<S>(stream: S, expected_size: usize) -> Self
    where
        S: asupersync::stream::Stream<Item = Result<Vec<u8>, BodyError>> + Send + Sync + 'static,
    {
        let mut body = Self::new(stream);
        body.expected_size = Some(expected_size);
        body
    }

    /// Bytes received so far.
    #[must_use]
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Expected total size, if the driver knew it.
    #[must_use]
    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// True once the stream terminated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Collects the remaining chunks into one buffer.
    ///
    /// # Errors
    ///
    /// Returns the tagged termination if the body failed mid-stream.
    pub async fn collect(mut self) -> Result<Vec<u8>, BodyError> {
        use asupersync::stream::StreamExt;

        let mut buffer = Vec::with_capacity(self.expected_size.unwrap_or(4096));
        while let Some(chunk) = self.inner.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        self.bytes_received = buffer.len();
        self.complete = true;
        Ok(buffer)
    }
}

impl asupersync::stream::Stream for StreamedBody {
    type Item = Result<Vec<u8>, BodyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.complete {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_received += chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.complete = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.complete = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Entity body handle on a dispatched request.
#[derive(Debug)]
pub enum RequestBody {
    /// The null-body sentinel: the request carried no entity.
    None,
    /// A streamed entity backed by the connection's body emitter.
    Streamed(StreamedBody),
}

impl RequestBody {
    /// True for the null-body sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Takes the stream, leaving the null sentinel behind.
    pub fn take_stream(&mut self) -> Option<StreamedBody> {
        match std::mem::replace(self, Self::None) {
            Self::Streamed(s) => Some(s),
            Self::None => None,
        }
    }
}

/// Per-request typed locals.
///
/// A small `TypeId`-keyed map for values handlers and filters want to hang
/// off the request without knowing about each other.
#[derive(Debug, Default)]
pub struct Locals {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Locals {
    /// Creates an empty locals map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Fetches a value by type.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Immutable request envelope handed to dispatch.
#[derive(Debug)]
pub struct Request {
    conn_id: u64,
    stream_id: u64,
    method: Method,
    uri: String,
    version: HttpVersion,
    headers: Headers,
    remote: Option<SocketAddr>,
    arrived_at: u64,
    http_date: String,
    body: RequestBody,
    cookies: OnceLock<Vec<(String, String)>>,
    locals: Locals,
}

impl Request {
    /// Builds a request envelope. Called by the pipeline, not applications.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        conn_id: u64,
        stream_id: u64,
        method: Method,
        uri: String,
        version: HttpVersion,
        headers: Headers,
        remote: Option<SocketAddr>,
        arrived_at: u64,
        http_date: String,
        body: RequestBody,
    ) -> Self {
        Self {
            conn_id,
            stream_id,
            method,
            uri,
            version,
            headers,
            remote,
            arrived_at,
            http_date,
            body,
            cookies: OnceLock::new(),
            locals: Locals::new(),
        }
    }

    /// The owning connection's id.
    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Stream id within the connection (always 0 for HTTP/1.x).
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target as received.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Protocol version.
    #[must_use]
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Peer address; `None` for unix-domain peers.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Arrival time, unix seconds from the loop ticker.
    #[must_use]
    pub fn arrived_at(&self) -> u64 {
        self.arrived_at
    }

    /// The cached `Date` header value current at arrival.
    #[must_use]
    pub fn http_date(&self) -> &str {
        &self.http_date
    }

    /// The entity body handle.
    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Mutable access to the body handle (for taking the stream).
    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Per-request typed locals.
    #[must_use]
    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    /// Mutable access to the locals map.
    pub fn locals_mut(&mut self) -> &mut Locals {
        &mut self.locals
    }

    /// Parsed cookies, computed once per request.
    ///
    /// All `Cookie` headers are concatenated and split into `name=value`
    /// pairs; malformed segments are skipped.
    pub fn cookies(&self) -> &[(String, String)] {
        self.cookies.get_or_init(|| {
            let mut pairs = Vec::new();
            for value in self.headers.get_all("cookie") {
                let Ok(value) = std::str::from_utf8(value) else {
                    continue;
                };
                for segment in value.split(';') {
                    let segment = segment.trim();
                    if segment.is_empty() {
                        continue;
                    }
                    match segment.split_once('=') {
                        Some((name, val)) if !name.is_empty() => {
                            pairs.push((name.trim().to_string(), val.trim().to_string()));
                        }
                        _ => {}
                    }
                }
            }
            pairs
        })
    }

    /// The `Host` header with any port stripped, if present and UTF-8.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get_str("host")?;
        // `[v6::literal]:port` keeps the bracketed literal intact.
        if let Some(rest) = host.strip_prefix('[') {
            return rest.split_once(']').map(|(lit, _)| &host[..lit.len() + 2]);
        }
        Some(host.split(':').next().unwrap_or(host))
    }

    /// Renders the request line and headers for a TRACE echo
    /// (`message/http`).
    #[must_use]
    pub fn trace_echo(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

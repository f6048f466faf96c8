//! Response production: the application-facing [`Responder`], the filter
//! chain, and the shared error-response path with filter recovery.
//!
//! A response is a part stream: `Head`, body chunks, `End`. Each part runs
//! through the filter chain (`begin → step → finish`), then the driver's
//! wire writer serializes it into the connection sink. A filter that
//! throws is identified by key; the server blacklists it and retries the
//! error response without it.

use std::sync::Arc;

use hearth_core::http::HttpVersion;
use hearth_core::request::BodyError;
use hearth_core::response::{ResponseHead, ResponsePart, ResponseState, StatusCode};
use parking_lot::Mutex;

use crate::client::{ConnSink, WriteGate};
use crate::driver::{WireError, WireWriter};

/// Failure inside a response filter, tagged with the filter's key.
#[derive(Debug, Clone)]
pub struct FilterError {
    /// Key of the filter that threw.
    pub key: String,
    /// What went wrong.
    pub message: String,
}

impl FilterError {
    /// Creates a filter error.
    #[must_use]
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter `{}` failed: {}", self.key, self.message)
    }
}

impl std::error::Error for FilterError {}

/// Ordered transform over response parts.
pub trait ResponseFilter: Send {
    /// Stable key identifying this filter for the blacklist.
    fn key(&self) -> &str;

    /// Sees (and may mutate) the head before it is committed.
    ///
    /// # Errors
    ///
    /// A [`FilterError`] blacklists this filter for the request.
    fn begin(&mut self, head: &mut ResponseHead) -> Result<(), FilterError>;

    /// Transforms one body chunk.
    ///
    /// # Errors
    ///
    /// A [`FilterError`] blacklists this filter for the request.
    fn step(&mut self, chunk: Vec<u8>) -> Result<Vec<u8>, FilterError>;

    /// Flushes any buffered tail when the body ends.
    ///
    /// # Errors
    ///
    /// A [`FilterError`] blacklists this filter for the request.
    fn finish(&mut self) -> Result<Option<Vec<u8>>, FilterError>;
}

/// Creates per-response filter instances; registered on a vhost.
pub trait FilterFactory: Send + Sync {
    /// The key new instances will report.
    fn key(&self) -> &str;

    /// Creates a fresh filter for one response.
    fn create(&self) -> Box<dyn ResponseFilter>;
}

/// Error surfaced by [`Responder`] operations.
#[derive(Debug)]
pub enum RespondError {
    /// Head mutation after the head was committed.
    AlreadyStarted,
    /// Writes after `end`.
    Ended,
    /// The client is gone; producing further output is pointless.
    Disconnected,
    /// A filter threw; the key is recorded for the blacklist.
    Filter(FilterError),
    /// The driver could not serialize a part.
    Wire(WireError),
    /// The driver has no server push.
    PushUnsupported,
}

impl std::fmt::Display for RespondError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "response already started"),
            Self::Ended => write!(f, "response already ended"),
            Self::Disconnected => write!(f, "client disconnected"),
            Self::Filter(e) => write!(f, "{e}"),
            Self::Wire(e) => write!(f, "{e}"),
            Self::PushUnsupported => write!(f, "driver does not support push"),
        }
    }
}

impl std::error::Error for RespondError {}

impl From<WireError> for RespondError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

struct ResponderInner {
    head: ResponseHead,
    state: ResponseState,
    version: HttpVersion,
    filters: Vec<Box<dyn ResponseFilter>>,
    writer: Box<dyn WireWriter>,
    sink: ConnSink,
    stream_id: u64,
    failed_filter: Option<String>,
    push_supported: bool,
}

/// The response object presented to the application.
///
/// Cloneable handle; the server keeps a twin to inspect state after the
/// handler resolves.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<Mutex<ResponderInner>>,
}

/// Future returned by streaming writes: ready unless the write crossed the
/// soft cap, in which case it waits on the connection's drain gate.
pub enum WriteOutcome {
    /// Completed (or failed) synchronously.
    Ready(Result<(), RespondError>),
    /// Suspended on backpressure.
    Gated(WriteGate),
}

impl std::future::Future for WriteOutcome {
    type Output = Result<(), RespondError>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match self.get_mut() {
            Self::Ready(result) => {
                std::task::Poll::Ready(std::mem::replace(result, Ok(())))
            }
            Self::Gated(gate) => std::pin::Pin::new(gate).poll(cx).map(|r| match r {
                Ok(()) => Ok(()),
                Err(BodyError::Disconnected) => Err(RespondError::Disconnected),
                Err(e) => Err(RespondError::Wire(WireError::new(e.to_string()))),
            }),
        }
    }
}

impl Responder {
    /// Builds a responder bound to one request stream.
    #[must_use]
    pub fn new(
        status: StatusCode,
        version: HttpVersion,
        filters: Vec<Box<dyn ResponseFilter>>,
        writer: Box<dyn WireWriter>,
        sink: ConnSink,
        stream_id: u64,
        push_supported: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResponderInner {
                head: ResponseHead::new(status),
                state: ResponseState::Created,
                version,
                filters,
                writer,
                sink,
                stream_id,
                failed_filter: None,
                push_supported,
            })),
        }
    }

    /// Current production state.
    #[must_use]
    pub fn state(&self) -> ResponseState {
        self.inner.lock().state
    }

    /// The status that will be (or was) sent.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.lock().head.status
    }

    /// Sets the status code.
    ///
    /// # Errors
    ///
    /// Fails with [`RespondError::AlreadyStarted`] once the head is
    /// committed.
    pub fn set_status(&self, status: StatusCode) -> Result<(), RespondError> {
        let mut inner = self.inner.lock();
        if inner.state != ResponseState::Created {
            return Err(RespondError::AlreadyStarted);
        }
        inner.head.status = status;
        Ok(())
    }

    /// Overrides the reason phrase.
    ///
    /// # Errors
    ///
    /// Fails once the head is committed.
    pub fn set_reason(&self, reason: impl Into<String>) -> Result<(), RespondError> {
        let mut inner = self.inner.lock();
        if inner.state != ResponseState::Created {
            return Err(RespondError::AlreadyStarted);
        }
        inner.head.reason = Some(reason.into());
        Ok(())
    }

    /// Sets a header, replacing previous values.
    ///
    /// # Errors
    ///
    /// Fails once the head is committed.
    pub fn set_header(
        &self,
        name: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), RespondError> {
        let mut inner = self.inner.lock();
        if inner.state != ResponseState::Created {
            return Err(RespondError::AlreadyStarted);
        }
        inner.head.headers.insert(name, value);
        Ok(())
    }

    /// Appends a header, keeping previous values.
    ///
    /// # Errors
    ///
    /// Fails once the head is committed.
    pub fn add_header(
        &self,
        name: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), RespondError> {
        let mut inner = self.inner.lock();
        if inner.state != ResponseState::Created {
            return Err(RespondError::AlreadyStarted);
        }
        inner.head.headers.add(name, value);
        Ok(())
    }

    /// Initiates a server push for `path`.
    ///
    /// # Errors
    ///
    /// [`RespondError::PushUnsupported`] on drivers without push (HTTP/1).
    pub fn push(&self, _path: &str) -> Result<(), RespondError> {
        let inner = self.inner.lock();
        if inner.push_supported {
            Ok(())
        } else {
            Err(RespondError::PushUnsupported)
        }
    }

    /// Streams one body chunk, committing the head first if needed.
    ///
    /// The returned future suspends when the connection's write buffer
    /// crossed the soft cap; it resolves once the loop drained it.
    #[must_use]
    pub fn write(&self, chunk: Vec<u8>) -> WriteOutcome {
        let mut inner = self.inner.lock();
        if let Err(e) = write_parts(&mut inner, Some(chunk), false) {
            return WriteOutcome::Ready(Err(e));
        }
        if inner.sink.over_soft_cap() {
            WriteOutcome::Gated(inner.sink.arm_gate())
        } else {
            WriteOutcome::Ready(Ok(()))
        }
    }

    /// Ends the response, optionally writing a final body chunk.
    #[must_use]
    pub fn end(&self, body: Option<Vec<u8>>) -> WriteOutcome {
        let mut inner = self.inner.lock();
        WriteOutcome::Ready(write_parts(&mut inner, body, true))
    }

    /// Implicit end after a handler returned with a started, unended
    /// response. Synchronous; backpressure is ignored for the tail.
    pub(crate) fn finish_implicit(&self) -> Result<(), RespondError> {
        let mut inner = self.inner.lock();
        if inner.state == ResponseState::Ended {
            return Ok(());
        }
        write_parts(&mut inner, None, true)
    }

    /// The key of the filter that threw, if one did.
    pub(crate) fn failed_filter(&self) -> Option<String> {
        self.inner.lock().failed_filter.clone()
    }

    /// The stream id this responder serves.
    pub(crate) fn stream_id(&self) -> u64 {
        self.inner.lock().stream_id
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Responder")
            .field("status", &inner.head.status)
            .field("state", &inner.state)
            .field("stream_id", &inner.stream_id)
            .finish()
    }
}

fn write_parts(
    inner: &mut ResponderInner,
    chunk: Option<Vec<u8>>,
    end: bool,
) -> Result<(), RespondError> {
    if inner.state == ResponseState::Ended {
        return Err(RespondError::Ended);
    }

    let mut staging = Vec::new();

    if inner.state == ResponseState::Created {
        let mut head = inner.head.clone();
        for filter in &mut inner.filters {
            if let Err(e) = filter.begin(&mut head) {
                inner.failed_filter = Some(e.key.clone());
                return Err(RespondError::Filter(e));
            }
        }
        // HTTP/1.0 cannot frame an unsized body; the connection closes
        // after this response instead.
        if inner.version == HttpVersion::Http10 && !head.headers.contains("content-length") {
            inner.sink.set_close_when_drained();
        }
        inner.head = head.clone();
        inner.writer.write_part(ResponsePart::Head(head), &mut staging)?;
        inner.state = ResponseState::Started;
    }

    if let Some(chunk) = chunk {
        let mut chunk = chunk;
        for filter in &mut inner.filters {
            match filter.step(chunk) {
                Ok(next) => chunk = next,
                Err(e) => {
                    inner.failed_filter = Some(e.key.clone());
                    return Err(RespondError::Filter(e));
                }
            }
        }
        if !chunk.is_empty() {
            inner
                .writer
                .write_part(ResponsePart::BodyChunk(chunk), &mut staging)?;
        }
    }

    if end {
        for i in 0..inner.filters.len() {
            match inner.filters[i].finish() {
                Ok(Some(mut tail)) => {
                    // a tail still flows through the remaining filters
                    for filter in &mut inner.filters[i + 1..] {
                        match filter.step(tail) {
                            Ok(next) => tail = next,
                            Err(e) => {
                                inner.failed_filter = Some(e.key.clone());
                                return Err(RespondError::Filter(e));
                            }
                        }
                    }
                    if !tail.is_empty() {
                        inner
                            .writer
                            .write_part(ResponsePart::BodyChunk(tail), &mut staging)?;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    inner.failed_filter = Some(e.key.clone());
                    return Err(RespondError::Filter(e));
                }
            }
        }
        inner.writer.write_part(ResponsePart::End, &mut staging)?;
        inner.state = ResponseState::Ended;
    }

    if inner.sink.push(&staging).is_err() {
        return Err(RespondError::Disconnected);
    }

    if end {
        inner.sink.register_completion(inner.stream_id);
    }

    Ok(())
}

/// A fixed response produced outside the application: pre-app fast paths,
/// parse errors, 404/500 fallbacks.
#[derive(Debug, Clone)]
pub struct FixedResponse {
    /// Status code.
    pub status: StatusCode,
    /// Optional reason override.
    pub reason: Option<String>,
    /// Extra headers beyond `date` and `content-length`.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl FixedResponse {
    /// Creates a fixed response.
    #[must_use]
    pub fn new(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body,
        }
    }

    /// Overrides the reason phrase.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn to_head(&self, http_date: &str) -> ResponseHead {
        let mut head = ResponseHead::new(self.status);
        head.reason = self.reason.clone();
        head.headers.insert("date", http_date.as_bytes().to_vec());
        for (name, value) in &self.headers {
            head.headers.add(name.clone(), value.clone());
        }
        head.headers
            .insert("content-length", self.body.len().to_string().into_bytes());
        head
    }
}

/// Serializes a fixed response straight into the sink, bypassing filters.
/// Used for pre-app responses.
pub(crate) fn send_fixed(
    sink: &ConnSink,
    mut writer: Box<dyn WireWriter>,
    response: &FixedResponse,
    http_date: &str,
    stream_id: u64,
) -> Result<(), RespondError> {
    let mut staging = Vec::new();
    writer.write_part(ResponsePart::Head(response.to_head(http_date)), &mut staging)?;
    if !response.body.is_empty() {
        writer.write_part(ResponsePart::BodyChunk(response.body.clone()), &mut staging)?;
    }
    writer.write_part(ResponsePart::End, &mut staging)?;
    if sink.push(&staging).is_err() {
        return Err(RespondError::Disconnected);
    }
    sink.register_completion(stream_id);
    Ok(())
}

/// Serializes a fixed response through the filter chain, excluding
/// blacklisted keys, retrying with a growing blacklist until no filter
/// throws. This is the filter-recovery loop.
///
/// Returns `Err(Disconnected)` when the sink is gone; that is terminal.
pub(crate) fn send_with_recovery(
    sink: &ConnSink,
    make_writer: &dyn Fn() -> Box<dyn WireWriter>,
    factories: &[Arc<dyn FilterFactory>],
    bad_keys: &mut Vec<String>,
    response: &FixedResponse,
    http_date: &str,
    stream_id: u64,
) -> Result<(), RespondError> {
    loop {
        let mut filters: Vec<Box<dyn ResponseFilter>> = factories
            .iter()
            .filter(|f| !bad_keys.iter().any(|k| k == f.key()))
            .map(|f| f.create())
            .collect();

        match try_filtered(sink, make_writer(), &mut filters, response, http_date) {
            Ok(()) => {
                sink.register_completion(stream_id);
                return Ok(());
            }
            Err(RespondError::Filter(e)) => {
                // blacklist the offender and retry without it
                if bad_keys.iter().any(|k| *k == e.key) {
                    return Err(RespondError::Filter(e));
                }
                bad_keys.push(e.key);
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_filtered(
    sink: &ConnSink,
    mut writer: Box<dyn WireWriter>,
    filters: &mut [Box<dyn ResponseFilter>],
    response: &FixedResponse,
    http_date: &str,
) -> Result<(), RespondError> {
    let mut staging = Vec::new();
    let mut head = response.to_head(http_date);
    for filter in filters.iter_mut() {
        filter
            .begin(&mut head)
            .map_err(RespondError::Filter)?;
    }

    let mut body = response.body.clone();
    for filter in filters.iter_mut() {
        body = filter.step(body).map_err(RespondError::Filter)?;
    }
    let mut tails = Vec::new();
    for filter in filters.iter_mut() {
        if let Some(tail) = filter.finish().map_err(RespondError::Filter)? {
            tails.push(tail);
        }
    }

    // filters may have changed the body size
    let total: usize = body.len() + tails.iter().map(Vec::len).sum::<usize>();
    head.headers
        .insert("content-length", total.to_string().into_bytes());

    writer.write_part(ResponsePart::Head(head), &mut staging)?;
    if !body.is_empty() {
        writer.write_part(ResponsePart::BodyChunk(body), &mut staging)?;
    }
    for tail in tails {
        if !tail.is_empty() {
            writer.write_part(ResponsePart::BodyChunk(tail), &mut staging)?;
        }
    }
    writer.write_part(ResponsePart::End, &mut staging)?;

    if sink.push(&staging).is_err() {
        return Err(RespondError::Disconnected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h1::Http1Driver;
    use crate::driver::HttpDriver;

    struct Upcase;

    impl ResponseFilter for Upcase {
        fn key(&self) -> &str {
            "upcase"
        }

        fn begin(&mut self, _head: &mut ResponseHead) -> Result<(), FilterError> {
            Ok(())
        }

        fn step(&mut self, chunk: Vec<u8>) -> Result<Vec<u8>, FilterError> {
            Ok(chunk.to_ascii_uppercase())
        }

        fn finish(&mut self) -> Result<Option<Vec<u8>>, FilterError> {
            Ok(None)
        }
    }

    struct Exploding;

    impl ResponseFilter for Exploding {
        fn key(&self) -> &str {
            "exploding"
        }

        fn begin(&mut self, _head: &mut ResponseHead) -> Result<(), FilterError> {
            Err(FilterError::new("exploding", "refused"))
        }

        fn step(&mut self, chunk: Vec<u8>) -> Result<Vec<u8>, FilterError> {
            Ok(chunk)
        }

        fn finish(&mut self) -> Result<Option<Vec<u8>>, FilterError> {
            Ok(None)
        }
    }

    struct ExplodingFactory;

    impl FilterFactory for ExplodingFactory {
        fn key(&self) -> &str {
            "exploding"
        }

        fn create(&self) -> Box<dyn ResponseFilter> {
            Box::new(Exploding)
        }
    }

    fn responder_with(filters: Vec<Box<dyn ResponseFilter>>) -> (Responder, ConnSink) {
        let driver = Http1Driver::new();
        let sink = ConnSink::new(1 << 16, 1 << 20);
        let responder = Responder::new(
            StatusCode::OK,
            HttpVersion::Http11,
            filters,
            driver.writer(HttpVersion::Http11, false),
            sink.clone(),
            0,
            false,
        );
        (responder, sink)
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("runtime must build");
        rt.block_on(future)
    }

    #[test]
    fn head_mutations_rejected_after_start() {
        let (responder, _sink) = responder_with(Vec::new());
        responder.set_status(StatusCode::NOT_FOUND).unwrap();
        block_on(responder.write(b"x".to_vec())).unwrap();

        assert_eq!(responder.state(), ResponseState::Started);
        assert!(matches!(
            responder.set_status(StatusCode::OK),
            Err(RespondError::AlreadyStarted)
        ));
        assert!(matches!(
            responder.set_header("x-late", b"1".to_vec()),
            Err(RespondError::AlreadyStarted)
        ));
    }

    #[test]
    fn filters_transform_chunks() {
        let (responder, sink) = responder_with(vec![Box::new(Upcase)]);
        block_on(responder.write(b"hello".to_vec())).unwrap();
        block_on(responder.end(None)).unwrap();

        let mut transport = DrainAll(Vec::new());
        sink.drain_into(&mut transport).unwrap();
        let wire = String::from_utf8(transport.0).unwrap();
        assert!(wire.contains("HELLO"));
        assert!(!wire.contains("hello"));
    }

    #[test]
    fn failing_filter_records_key() {
        let (responder, _sink) = responder_with(vec![Box::new(Exploding)]);
        let result = block_on(responder.write(b"x".to_vec()));
        assert!(matches!(result, Err(RespondError::Filter(_))));
        assert_eq!(responder.failed_filter().as_deref(), Some("exploding"));
        // the head never committed
        assert_eq!(responder.state(), ResponseState::Created);
    }

    #[test]
    fn end_registers_completion() {
        let (responder, sink) = responder_with(Vec::new());
        block_on(responder.end(Some(b"done".to_vec()))).unwrap();
        assert_eq!(responder.state(), ResponseState::Ended);

        let mut transport = DrainAll(Vec::new());
        sink.drain_into(&mut transport).unwrap();
        assert_eq!(sink.take_completions_if_drained(), vec![0]);
    }

    #[test]
    fn recovery_drops_bad_filter_and_succeeds() {
        let driver = Http1Driver::new();
        let sink = ConnSink::new(1 << 16, 1 << 20);
        let factories: Vec<Arc<dyn FilterFactory>> = vec![Arc::new(ExplodingFactory)];
        let mut bad = Vec::new();

        let response = FixedResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            b"oops".to_vec(),
        );
        send_with_recovery(
            &sink,
            &|| driver.writer(HttpVersion::Http11, false),
            &factories,
            &mut bad,
            &response,
            "Thu, 01 Jan 1970 00:00:00 GMT",
            3,
        )
        .unwrap();

        assert_eq!(bad, vec!["exploding".to_string()]);
        let mut transport = DrainAll(Vec::new());
        sink.drain_into(&mut transport).unwrap();
        let wire = String::from_utf8(transport.0).unwrap();
        assert!(wire.starts_with("HTTP/1.1 500"));
        assert!(wire.contains("oops"));
    }

    struct DrainAll(Vec<u8>);

    impl crate::transport::Transport for DrainAll {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::WouldBlock.into())
        }

        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn shutdown(&mut self) {}
    }
}

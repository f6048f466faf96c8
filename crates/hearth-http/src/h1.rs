//! HTTP/1.1 driver.
//!
//! Implements the driver contract for HTTP/1.1: an incremental parser
//! turning connection bytes into parser events (Content-Length and
//! chunked framing), and a wire writer serializing response parts with
//! identity or chunked framing. Requests on one connection get ascending
//! stream ids so late body callbacks never hit a newer request's emitter.

use hearth_core::http::{Headers, HttpVersion};
use hearth_core::options::Options;
use hearth_core::response::{ResponsePart, StatusCode};

use crate::driver::{
    HttpDriver, ParserEvent, RequestHead, RequestParser, WireError, WireWriter,
};

/// Default request body cap before a size warning (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum accumulated request-line + header bytes.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// The HTTP/1.1 protocol driver.
#[derive(Debug, Clone)]
pub struct Http1Driver {
    max_body_size: usize,
}

impl Http1Driver {
    /// Creates a driver with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Sets the entity size that trips a size warning.
    #[must_use]
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }
}

impl Default for Http1Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDriver for Http1Driver {
    fn name(&self) -> &'static str {
        "http/1.1"
    }

    fn parser(&self, _options: &Options) -> Box<dyn RequestParser> {
        Box::new(H1Parser::new(self.max_body_size))
    }

    fn writer(&self, version: HttpVersion, head_request: bool) -> Box<dyn WireWriter> {
        Box::new(H1Writer::new(version, head_request))
    }
}

#[derive(Clone, Copy)]
enum ParseState {
    Line,
    Headers {
        line_end: usize,
    },
    Body {
        stream_id: u64,
        remaining: usize,
    },
    ChunkSize {
        stream_id: u64,
    },
    ChunkData {
        stream_id: u64,
        remaining: usize,
    },
    ChunkDataEnd {
        stream_id: u64,
    },
    ChunkTrailer {
        stream_id: u64,
    },
    Failed,
}

struct H1Parser {
    state: ParseState,
    buf: Vec<u8>,
    next_stream: u64,
    body_received: usize,
    warned: bool,
    max_body: usize,
}

impl H1Parser {
    fn new(max_body: usize) -> Self {
        Self {
            state: ParseState::Line,
            buf: Vec::new(),
            next_stream: 0,
            body_received: 0,
            warned: false,
            max_body,
        }
    }

    fn fail(&mut self, status: StatusCode, message: impl Into<String>, events: &mut Vec<ParserEvent>) {
        self.state = ParseState::Failed;
        self.buf.clear();
        events.push(ParserEvent::ParseError {
            status,
            message: message.into(),
        });
    }

    fn note_body_bytes(&mut self, len: usize, stream_id: u64, events: &mut Vec<ParserEvent>) {
        self.body_received += len;
        if !self.warned && self.body_received > self.max_body {
            self.warned = true;
            events.push(ParserEvent::SizeWarning {
                stream_id,
                received: self.body_received,
                limit: self.max_body,
            });
        }
    }

    fn begin_request(&mut self, head_end: usize, events: &mut Vec<ParserEvent>) {
        let head_bytes = self.buf.drain(..head_end).collect::<Vec<u8>>();
        let text = match std::str::from_utf8(&head_bytes) {
            Ok(text) => text,
            Err(_) => {
                self.fail(StatusCode::BAD_REQUEST, "head is not valid ascii", events);
                return;
            }
        };

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
        let (method, uri, version_token) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(u), Some(v), None) => (m, u, v),
                _ => {
                    self.fail(StatusCode::BAD_REQUEST, "malformed request line", events);
                    return;
                }
            };

        let version = match HttpVersion::parse(version_token) {
            Some(v @ (HttpVersion::Http10 | HttpVersion::Http11)) => v,
            Some(HttpVersion::H2) | None => {
                self.fail(
                    StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                    format!("unsupported version {version_token}"),
                    events,
                );
                return;
            }
        };

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                self.fail(StatusCode::BAD_REQUEST, "malformed header line", events);
                return;
            };
            if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
                self.fail(StatusCode::BAD_REQUEST, "malformed header name", events);
                return;
            }
            headers.add(name.to_string(), value.trim().as_bytes().to_vec());
        }

        let stream_id = self.next_stream;
        self.next_stream += 1;
        self.body_received = 0;
        self.warned = false;

        let chunked = headers
            .get_str("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

        let content_length = match headers.get_str("content-length") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    self.fail(StatusCode::BAD_REQUEST, "invalid content-length", events);
                    return;
                }
            },
            None => None,
        };

        // Transfer-Encoding and Content-Length together is the request
        // smuggling ambiguity; refuse rather than pick a framing.
        if headers.contains("transfer-encoding") && content_length.is_some() {
            self.fail(StatusCode::BAD_REQUEST, "ambiguous body length", events);
            return;
        }

        let head = RequestHead {
            stream_id,
            method: method.as_bytes().to_vec(),
            uri: uri.to_string(),
            version,
            headers,
            content_length,
        };

        if chunked {
            events.push(ParserEvent::EntityHeaders(head));
            self.state = ParseState::ChunkSize { stream_id };
        } else {
            match content_length {
                Some(n) if n > 0 => {
                    events.push(ParserEvent::EntityHeaders(head));
                    self.state = ParseState::Body {
                        stream_id,
                        remaining: n,
                    };
                }
                _ => {
                    events.push(ParserEvent::HeadersOnly(head));
                    self.state = ParseState::Line;
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    let start = from.min(haystack.len());
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + start)
}

impl RequestParser for H1Parser {
    fn feed(&mut self, bytes: &[u8], events: &mut Vec<ParserEvent>) {
        if matches!(self.state, ParseState::Failed) {
            return;
        }
        self.buf.extend_from_slice(bytes);

        loop {
            match self.state {
                ParseState::Line => {
                    // tolerate a stray CRLF between pipelined requests
                    while self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                    }
                    match find(&self.buf, b"\r\n", 0) {
                        Some(end) => {
                            self.state = ParseState::Headers { line_end: end };
                        }
                        None if self.buf.len() > MAX_HEAD_BYTES => {
                            self.fail(
                                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                                "request line too long",
                                events,
                            );
                            return;
                        }
                        None => return,
                    }
                }
                ParseState::Headers { line_end } => {
                    match find(&self.buf, b"\r\n\r\n", line_end) {
                        Some(end) => {
                            self.begin_request(end + 4, events);
                            if matches!(self.state, ParseState::Failed) {
                                return;
                            }
                        }
                        None if self.buf.len() > MAX_HEAD_BYTES => {
                            self.fail(
                                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                                "header block too large",
                                events,
                            );
                            return;
                        }
                        None => return,
                    }
                }
                ParseState::Body {
                    stream_id,
                    remaining,
                } => {
                    if self.buf.is_empty() {
                        return;
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.drain(..take).collect::<Vec<u8>>();
                    self.note_body_bytes(chunk.len(), stream_id, events);
                    events.push(ParserEvent::EntityPart { stream_id, chunk });
                    if remaining == take {
                        events.push(ParserEvent::EntityComplete { stream_id });
                        self.state = ParseState::Line;
                    } else {
                        self.state = ParseState::Body {
                            stream_id,
                            remaining: remaining - take,
                        };
                    }
                }
                ParseState::ChunkSize { stream_id } => match find(&self.buf, b"\r\n", 0) {
                    Some(end) => {
                        let line = self.buf.drain(..end + 2).collect::<Vec<u8>>();
                        let text = String::from_utf8_lossy(&line[..end]);
                        let size_token = text.split(';').next().unwrap_or("").trim();
                        match usize::from_str_radix(size_token, 16) {
                            Ok(0) => {
                                self.state = ParseState::ChunkTrailer { stream_id };
                            }
                            Ok(size) => {
                                self.state = ParseState::ChunkData {
                                    stream_id,
                                    remaining: size,
                                };
                            }
                            Err(_) => {
                                self.fail(StatusCode::BAD_REQUEST, "invalid chunk size", events);
                                return;
                            }
                        }
                    }
                    None => return,
                },
                ParseState::ChunkData {
                    stream_id,
                    remaining,
                } => {
                    if self.buf.is_empty() {
                        return;
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.drain(..take).collect::<Vec<u8>>();
                    self.note_body_bytes(chunk.len(), stream_id, events);
                    events.push(ParserEvent::EntityPart { stream_id, chunk });
                    if remaining == take {
                        self.state = ParseState::ChunkDataEnd { stream_id };
                    } else {
                        self.state = ParseState::ChunkData {
                            stream_id,
                            remaining: remaining - take,
                        };
                    }
                }
                ParseState::ChunkDataEnd { stream_id } => {
                    if self.buf.len() < 2 {
                        return;
                    }
                    if !self.buf.starts_with(b"\r\n") {
                        self.fail(StatusCode::BAD_REQUEST, "missing chunk delimiter", events);
                        return;
                    }
                    self.buf.drain(..2);
                    self.state = ParseState::ChunkSize { stream_id };
                }
                ParseState::ChunkTrailer { stream_id } => {
                    // consume trailer lines up to the blank line
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        events.push(ParserEvent::EntityComplete { stream_id });
                        self.state = ParseState::Line;
                        continue;
                    }
                    match find(&self.buf, b"\r\n", 0) {
                        Some(end) => {
                            self.buf.drain(..end + 2);
                        }
                        None => return,
                    }
                }
                ParseState::Failed => return,
            }
        }
    }
}

enum WriterStage {
    Head,
    Body,
    Done,
}

enum Framing {
    Identity,
    Chunked,
}

struct H1Writer {
    version: HttpVersion,
    head_request: bool,
    stage: WriterStage,
    framing: Framing,
}

impl H1Writer {
    fn new(version: HttpVersion, head_request: bool) -> Self {
        Self {
            version,
            head_request,
            stage: WriterStage::Head,
            framing: Framing::Identity,
        }
    }
}

impl WireWriter for H1Writer {
    fn write_part(&mut self, part: ResponsePart, out: &mut Vec<u8>) -> Result<(), WireError> {
        match part {
            ResponsePart::Head(mut head) => {
                if !matches!(self.stage, WriterStage::Head) {
                    return Err(WireError::new("head written twice"));
                }

                let sized = head.headers.contains("content-length");
                if !sized && self.version == HttpVersion::Http11 {
                    self.framing = Framing::Chunked;
                    head.headers.insert("transfer-encoding", b"chunked".to_vec());
                } else {
                    // unsized HTTP/1.0 bodies run to connection close
                    self.framing = Framing::Identity;
                }

                let version = match self.version {
                    HttpVersion::Http10 => "HTTP/1.0",
                    _ => "HTTP/1.1",
                };
                out.extend_from_slice(version.as_bytes());
                out.push(b' ');
                out.extend_from_slice(head.status.as_u16().to_string().as_bytes());
                out.push(b' ');
                out.extend_from_slice(head.reason().as_bytes());
                out.extend_from_slice(b"\r\n");
                for (name, value) in head.headers.iter() {
                    out.extend_from_slice(name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(value);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"\r\n");
                self.stage = WriterStage::Body;
                Ok(())
            }
            ResponsePart::BodyChunk(chunk) => {
                if !matches!(self.stage, WriterStage::Body) {
                    return Err(WireError::new("body chunk outside body stage"));
                }
                if self.head_request || chunk.is_empty() {
                    return Ok(());
                }
                match self.framing {
                    Framing::Identity => out.extend_from_slice(&chunk),
                    Framing::Chunked => {
                        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                        out.extend_from_slice(&chunk);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                Ok(())
            }
            ResponsePart::End => {
                if !matches!(self.stage, WriterStage::Body) {
                    return Err(WireError::new("end outside body stage"));
                }
                if matches!(self.framing, Framing::Chunked) && !self.head_request {
                    out.extend_from_slice(b"0\r\n\r\n");
                }
                self.stage = WriterStage::Done;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::response::ResponseHead;

    fn feed_all(parser: &mut Box<dyn RequestParser>, bytes: &[u8]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        parser.feed(bytes, &mut events);
        events
    }

    fn new_parser() -> Box<dyn RequestParser> {
        Http1Driver::new().parser(&Options::new())
    }

    #[test]
    fn parses_headers_only_request() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"GET /path?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
        );

        assert_eq!(events.len(), 1);
        match &events[0] {
            ParserEvent::HeadersOnly(head) => {
                assert_eq!(head.method, b"GET");
                assert_eq!(head.uri, "/path?q=1");
                assert_eq!(head.version, HttpVersion::Http11);
                assert_eq!(head.headers.get_str("host"), Some("example.com"));
                assert_eq!(head.stream_id, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn split_feed_resumes() {
        let mut parser = new_parser();
        assert!(feed_all(&mut parser, b"GET / HT").is_empty());
        assert!(feed_all(&mut parser, b"TP/1.1\r\nHost: a").is_empty());
        let events = feed_all(&mut parser, b"\r\n\r\n");
        assert!(matches!(events[0], ParserEvent::HeadersOnly(_)));
    }

    #[test]
    fn content_length_body_streams() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhel",
        );
        assert!(matches!(events[0], ParserEvent::EntityHeaders(_)));
        assert!(
            matches!(&events[1], ParserEvent::EntityPart { chunk, .. } if chunk == b"hel")
        );

        let events = feed_all(&mut parser, b"lo");
        assert!(
            matches!(&events[0], ParserEvent::EntityPart { chunk, .. } if chunk == b"lo")
        );
        assert!(matches!(events[1], ParserEvent::EntityComplete { stream_id: 0 }));
    }

    #[test]
    fn chunked_body_streams() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n\r\n",
        );

        assert!(matches!(events[0], ParserEvent::EntityHeaders(_)));
        assert!(
            matches!(&events[1], ParserEvent::EntityPart { chunk, .. } if chunk == b"wiki")
        );
        assert!(matches!(events[2], ParserEvent::EntityComplete { .. }));
    }

    #[test]
    fn pipelined_requests_get_ascending_stream_ids() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\n",
        );

        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (ParserEvent::HeadersOnly(first), ParserEvent::HeadersOnly(second)) => {
                assert_eq!(first.stream_id, 0);
                assert_eq!(second.stream_id, 1);
                assert_eq!(first.uri, "/a");
                assert_eq!(second.uri, "/b");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn oversize_body_warns_once_and_keeps_streaming() {
        let driver = Http1Driver::new().with_max_body_size(4);
        let mut parser = driver.parser(&Options::new());
        let mut events = Vec::new();
        parser.feed(
            b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n0123456789",
            &mut events,
        );

        let warnings = events
            .iter()
            .filter(|e| matches!(e, ParserEvent::SizeWarning { .. }))
            .count();
        assert_eq!(warnings, 1);
        // the stream still completes
        assert!(events
            .iter()
            .any(|e| matches!(e, ParserEvent::EntityComplete { .. })));
    }

    #[test]
    fn malformed_request_line_fails() {
        let mut parser = new_parser();
        let events = feed_all(&mut parser, b"BROKEN\r\n\r\n");
        assert!(matches!(
            events[0],
            ParserEvent::ParseError {
                status: StatusCode::BAD_REQUEST,
                ..
            }
        ));

        // the parser stays failed
        assert!(feed_all(&mut parser, b"GET / HTTP/1.1\r\n\r\n").is_empty());
    }

    #[test]
    fn unsupported_version_fails_with_505() {
        let mut parser = new_parser();
        let events = feed_all(&mut parser, b"GET / HTTP/0.9\r\n\r\n");
        assert!(matches!(
            events[0],
            ParserEvent::ParseError {
                status: StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                ..
            }
        ));
    }

    #[test]
    fn invalid_content_length_fails() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: ten\r\n\r\n",
        );
        assert!(matches!(events[0], ParserEvent::ParseError { .. }));
    }

    #[test]
    fn simultaneous_content_length_and_chunked_fails() {
        let mut parser = new_parser();
        let events = feed_all(
            &mut parser,
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\nabcd",
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ParserEvent::ParseError {
                status: StatusCode::BAD_REQUEST,
                ..
            }
        ));

        // the parser stays failed; the smuggled tail is never surfaced
        assert!(feed_all(&mut parser, b"GET / HTTP/1.1\r\n\r\n").is_empty());
    }

    #[test]
    fn writer_identity_with_content_length() {
        let driver = Http1Driver::new();
        let mut writer = driver.writer(HttpVersion::Http11, false);
        let mut out = Vec::new();

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert("content-length", b"5".to_vec());
        writer.write_part(ResponsePart::Head(head), &mut out).unwrap();
        writer
            .write_part(ResponsePart::BodyChunk(b"hello".to_vec()), &mut out)
            .unwrap();
        writer.write_part(ResponsePart::End, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn writer_chunked_when_unsized() {
        let driver = Http1Driver::new();
        let mut writer = driver.writer(HttpVersion::Http11, false);
        let mut out = Vec::new();

        writer
            .write_part(ResponsePart::Head(ResponseHead::new(StatusCode::OK)), &mut out)
            .unwrap();
        writer
            .write_part(ResponsePart::BodyChunk(b"abc".to_vec()), &mut out)
            .unwrap();
        writer.write_part(ResponsePart::End, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.contains("3\r\nabc\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn writer_suppresses_head_request_body() {
        let driver = Http1Driver::new();
        let mut writer = driver.writer(HttpVersion::Http11, true);
        let mut out = Vec::new();

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert("content-length", b"5".to_vec());
        writer.write_part(ResponsePart::Head(head), &mut out).unwrap();
        writer
            .write_part(ResponsePart::BodyChunk(b"hello".to_vec()), &mut out)
            .unwrap();
        writer.write_part(ResponsePart::End, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn writer_rejects_part_order_violations() {
        let driver = Http1Driver::new();
        let mut writer = driver.writer(HttpVersion::Http11, false);
        let mut out = Vec::new();

        assert!(writer
            .write_part(ResponsePart::BodyChunk(b"x".to_vec()), &mut out)
            .is_err());
    }
}

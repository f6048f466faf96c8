//! Response model: status codes, the structured head, and response parts.
//!
//! A response travels through the pipeline as a sequence of
//! [`ResponsePart`]s: exactly one `Head`, zero or more `BodyChunk`s, and a
//! terminating `End`. Filters transform parts; the driver's wire writer
//! serializes them into the connection's write buffer.

use std::fmt;

use crate::http::Headers;

/// HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 100 Continue
    pub const CONTINUE: Self = Self(100);
    /// 101 Switching Protocols
    pub const SWITCHING_PROTOCOLS: Self = Self(101);
    /// 200 OK
    pub const OK: Self = Self(200);
    /// 204 No Content
    pub const NO_CONTENT: Self = Self(204);
    /// 400 Bad Request
    pub const BAD_REQUEST: Self = Self(400);
    /// 404 Not Found
    pub const NOT_FOUND: Self = Self(404);
    /// 405 Method Not Allowed
    pub const METHOD_NOT_ALLOWED: Self = Self(405);
    /// 408 Request Timeout
    pub const REQUEST_TIMEOUT: Self = Self(408);
    /// 413 Content Too Large
    pub const CONTENT_TOO_LARGE: Self = Self(413);
    /// 431 Request Header Fields Too Large
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: Self = Self(431);
    /// 500 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    /// 501 Not Implemented
    pub const NOT_IMPLEMENTED: Self = Self(501);
    /// 503 Service Unavailable
    pub const SERVICE_UNAVAILABLE: Self = Self(503);
    /// 505 HTTP Version Not Supported
    pub const HTTP_VERSION_NOT_SUPPORTED: Self = Self(505);

    /// Creates a status code from a raw u16.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        Self(code)
    }

    /// The numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// True for 1xx codes.
    #[must_use]
    pub const fn is_informational(self) -> bool {
        self.0 >= 100 && self.0 < 200
    }

    /// True for 2xx codes.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// True for 4xx codes.
    #[must_use]
    pub const fn is_client_error(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// True for 5xx codes.
    #[must_use]
    pub const fn is_server_error(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Canonical reason phrase for this code.
    #[must_use]
    pub const fn canonical_reason(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Content Too Large",
            414 => "URI Too Long",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.canonical_reason())
    }
}

/// Lifecycle of a response production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Nothing written yet; status and headers are still mutable.
    Created,
    /// The head has been committed to the wire.
    Started,
    /// The body is complete.
    Ended,
}

/// Structured response head: status, optional reason override, headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// The status code.
    pub status: StatusCode,
    /// Reason phrase override; `None` uses the canonical phrase.
    pub reason: Option<String>,
    /// Response headers, insertion-ordered.
    pub headers: Headers,
}

impl ResponseHead {
    /// Creates a head with the given status and no headers.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
        }
    }

    /// The effective reason phrase.
    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }
}

/// One unit of response traffic through filters and the codec.
#[derive(Debug)]
pub enum ResponsePart {
    /// Status line and headers. First and exactly once.
    Head(ResponseHead),
    /// A body chunk. May be empty; empty chunks are dropped by the codec.
    BodyChunk(Vec<u8>),
    /// End of body. Last and exactly once.
    End,
}

/// Default HTML body for an error status.
#[must_use]
pub fn default_error_body(status: StatusCode, detail: Option<&str>) -> Vec<u8> {
    let mut body = format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1>",
        code = status.as_u16(),
        reason = html_escape(status.canonical_reason()),
    );
    if let Some(detail) = detail {
        body.push_str("<pre>");
        body.push_str(&html_escape(detail));
        body.push_str("</pre>");
    }
    body.push_str("</body></html>");
    body.into_bytes()
}

/// Escapes `&`, `<`, `>`, and `"` for embedding in an HTML error body.
#[must_use]
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(StatusCode::CONTINUE.is_informational());
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::NOT_FOUND.is_client_error());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_server_error());
    }

    #[test]
    fn canonical_reasons() {
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED.canonical_reason(), "Method Not Allowed");
        assert_eq!(StatusCode::from_u16(999).canonical_reason(), "Unknown");
    }

    #[test]
    fn head_reason_override() {
        let mut head = ResponseHead::new(StatusCode::BAD_REQUEST);
        assert_eq!(head.reason(), "Bad Request");

        head.reason = Some("Bad Request: Invalid Host".to_string());
        assert_eq!(head.reason(), "Bad Request: Invalid Host");
    }

    #[test]
    fn escaping_covers_markup() {
        assert_eq!(
            html_escape(r#"<b>"a" & b</b>"#),
            "&lt;b&gt;&quot;a&quot; &amp; b&lt;/b&gt;"
        );
    }

    #[test]
    fn error_body_embeds_escaped_detail() {
        let body = default_error_body(StatusCode::INTERNAL_SERVER_ERROR, Some("boom <here>"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("500 Internal Server Error"));
        assert!(text.contains("boom &lt;here&gt;"));
    }
}

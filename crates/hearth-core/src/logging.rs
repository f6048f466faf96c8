//! Structured logging for the server core.
//!
//! Entries carry a level, a message, the connection id when one is in
//! scope, and bounded key/value fields. Output is JSON for production or a
//! compact single line; the sink is pluggable. The level gate is checked
//! before entries are constructed, so disabled debug logging costs one
//! branch.

use std::fmt;
use std::sync::Arc;

/// Maximum structured fields per entry; extras are dropped.
pub const MAX_FIELDS: usize = 16;

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Most verbose, for detailed debugging.
    Debug = 0,
    /// Normal operation.
    Info = 1,
    /// Unexpected but recoverable.
    Warn = 2,
    /// A failure that affected processing.
    Error = 3,
}

impl LogLevel {
    /// Lowercase level name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Single-character tag for compact output.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Connection id, when the entry concerns one connection.
    pub conn_id: Option<u64>,
    /// Module path or subsystem tag.
    pub target: Option<String>,
    /// Structured key/value fields, capped at [`MAX_FIELDS`].
    pub fields: Vec<(String, String)>,
    /// Unix seconds from the loop ticker.
    pub timestamp_secs: u64,
}

impl LogEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            conn_id: None,
            target: None,
            fields: Vec::new(),
            timestamp_secs: 0,
        }
    }

    /// Tags the entry with a connection id.
    #[must_use]
    pub fn conn(mut self, id: u64) -> Self {
        self.conn_id = Some(id);
        self
    }

    /// Sets the subsystem tag.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Adds a structured field. Fields beyond the cap are dropped.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        if self.fields.len() < MAX_FIELDS {
            self.fields.push((key.into(), value.to_string()));
        }
        self
    }

    /// Stamps the entry with loop time.
    #[must_use]
    pub fn at(mut self, unix_secs: u64) -> Self {
        self.timestamp_secs = unix_secs;
        self
    }

    /// JSON rendering.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut json = format!(
            r#"{{"ts":{},"level":"{}","message":"{}""#,
            self.timestamp_secs,
            self.level,
            escape_json(&self.message),
        );
        if let Some(id) = self.conn_id {
            json.push_str(&format!(r#","conn":{id}"#));
        }
        if let Some(ref target) = self.target {
            json.push_str(&format!(r#","target":"{}""#, escape_json(target)));
        }
        if !self.fields.is_empty() {
            json.push_str(r#","fields":{"#);
            for (i, (k, v)) in self.fields.iter().enumerate() {
                if i > 0 {
                    json.push(',');
                }
                json.push_str(&format!(r#""{}":"{}""#, escape_json(k), escape_json(v)));
            }
            json.push('}');
        }
        json.push('}');
        json
    }

    /// Compact single-line rendering.
    #[must_use]
    pub fn to_compact(&self) -> String {
        let mut out = String::new();
        out.push('[');
        out.push(self.level.as_char());
        out.push(']');
        if let Some(id) = self.conn_id {
            out.push_str(&format!(" conn={id}"));
        }
        out.push(' ');
        out.push_str(&self.message);
        if !self.fields.is_empty() {
            out.push_str(" {");
            for (i, (k, v)) in self.fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{k}={v}"));
            }
            out.push('}');
        }
        out
    }
}

/// Escapes a string for JSON embedding.
#[must_use]
pub fn escape_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Destination for finished entries.
pub trait LogSink: Send + Sync {
    /// Consumes one entry.
    fn emit(&self, entry: &LogEntry);
}

/// Sink writing compact lines to stderr.
#[derive(Debug, Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn emit(&self, entry: &LogEntry) {
        eprintln!("{}", entry.to_compact());
    }
}

/// Sink collecting entries for assertions in tests.
#[derive(Debug, Default)]
pub struct CaptureSink {
    entries: parking_lot::Mutex<Vec<LogEntry>>,
}

impl CaptureSink {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of captured entries.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// True when a captured message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for CaptureSink {
    fn emit(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// Level-gated logger handle. Cheap to clone; shared by the whole server.
#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// Creates a logger with the given gate and sink.
    #[must_use]
    pub fn new(level: LogLevel, sink: Arc<dyn LogSink>) -> Self {
        Self { level, sink }
    }

    /// Stderr logger at `Info`.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(LogLevel::Info, Arc::new(StderrSink))
    }

    /// True when entries at `level` pass the gate. Check this before
    /// constructing an expensive entry.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    /// True when debug entries pass the gate.
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.enabled(LogLevel::Debug)
    }

    /// Emits an entry if its level passes the gate.
    pub fn log(&self, entry: LogEntry) {
        if self.enabled(entry.level) {
            self.sink.emit(&entry);
        }
    }

    /// Info-level message.
    pub fn info(&self, message: impl Into<String>) {
        if self.enabled(LogLevel::Info) {
            self.sink.emit(&LogEntry::new(LogLevel::Info, message));
        }
    }

    /// Warn-level message.
    pub fn warn(&self, message: impl Into<String>) {
        if self.enabled(LogLevel::Warn) {
            self.sink.emit(&LogEntry::new(LogLevel::Warn, message));
        }
    }

    /// Error-level message.
    pub fn error(&self, message: impl Into<String>) {
        if self.enabled(LogLevel::Error) {
            self.sink.emit(&LogEntry::new(LogLevel::Error, message));
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("level", &self.level).finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::stderr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn gate_filters_below_level() {
        let sink = Arc::new(CaptureSink::new());
        let logger = Logger::new(LogLevel::Warn, sink.clone());

        logger.info("quiet");
        logger.warn("loud");
        logger.error("louder");

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "loud");
        assert!(!logger.debug_enabled());
    }

    #[test]
    fn json_escapes_message() {
        let entry = LogEntry::new(LogLevel::Info, "a \"quoted\"\nline").at(42);
        let json = entry.to_json();
        assert!(json.contains(r#""ts":42"#));
        assert!(json.contains(r#"a \"quoted\"\nline"#));
    }

    #[test]
    fn fields_are_capped() {
        let mut entry = LogEntry::new(LogLevel::Info, "caps");
        for i in 0..(MAX_FIELDS + 4) {
            entry = entry.field(format!("k{i}"), i);
        }
        assert_eq!(entry.fields.len(), MAX_FIELDS);
    }

    #[test]
    fn compact_includes_conn_and_fields() {
        let entry = LogEntry::new(LogLevel::Warn, "slow drain")
            .conn(9)
            .field("buffered", 4096);
        assert_eq!(entry.to_compact(), "[W] conn=9 slow drain {buffered=4096}");
    }
}

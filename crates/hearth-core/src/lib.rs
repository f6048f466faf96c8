//! Core types for the hearth HTTP server.
//!
//! This crate provides the protocol-independent building blocks:
//! - [`Options`] — validated, lockable configuration
//! - [`Ticker`] — loop-owned clock with a cached HTTP date
//! - [`Request`] / [`StreamedBody`] — the dispatch-view request envelope
//! - [`ResponseHead`] / [`ResponsePart`] — the response part model
//! - [`ServerState`] / [`Observer`] — the lifecycle state machine
//! - [`Snapshot`] — the monitoring surface
//! - structured logging
//!
//! The connection core, drivers, and pipelines live in `hearth-http`.

#![forbid(unsafe_code)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::format_push_string)]
#![allow(clippy::single_match_else)]

pub mod clock;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod options;
pub mod request;
pub mod response;

pub use clock::{imf_fixdate, Ticker};
pub use http::{format_allow_header, Headers, HttpVersion, Method};
pub use lifecycle::{
    transition, BoxFuture, NotifyAll, NotifyOutcome, Observer, ObserverError, ObserverFuture,
    ObserverHandle, ObserverSet, ServerState, TransitionError,
};
pub use logging::{CaptureSink, LogEntry, LogLevel, LogSink, Logger, StderrSink};
pub use monitor::Snapshot;
pub use options::{Options, OptionsError};
pub use request::{BodyError, Locals, Request, RequestBody, StreamedBody};
pub use response::{
    default_error_body, html_escape, ResponseHead, ResponsePart, ResponseState, StatusCode,
};

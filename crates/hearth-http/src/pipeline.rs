//! Dispatch seams: application handlers, virtual hosts, host selection.
//!
//! The dispatch ordering itself (pre-app fast paths, bookkeeping) lives on
//! the server; this module defines what it dispatches *to*.

use std::sync::Arc;

use hearth_core::lifecycle::BoxFuture;
use hearth_core::request::{BodyError, Request};

use crate::listener::Endpoint;
use crate::respond::{FilterFactory, RespondError, Responder};

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<Result<(), AppError>>;

/// Failure surfaced by an application handler.
#[derive(Debug)]
pub enum AppError {
    /// The client went away; handlers may ignore this, the server logs it.
    Disconnect,
    /// Anything else; translated to a 500 unless the response started.
    Failure(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnect => write!(f, "client disconnected"),
            Self::Failure(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<BodyError> for AppError {
    fn from(e: BodyError) -> Self {
        if e.is_disconnect() {
            Self::Disconnect
        } else {
            Self::Failure(e.to_string())
        }
    }
}

impl From<RespondError> for AppError {
    fn from(e: RespondError) -> Self {
        match e {
            RespondError::Disconnected => Self::Disconnect,
            other => Self::Failure(other.to_string()),
        }
    }
}

/// An application entry point bound to a vhost.
pub trait Handler: Send + Sync {
    /// Handles one request, producing the response through `response`.
    fn handle(&self, request: Request, response: Responder) -> HandlerFuture;
}

/// [`Handler`] from a plain function or closure.
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(Request, Responder) -> HandlerFuture + Send + Sync,
{
    fn handle(&self, request: Request, response: Responder) -> HandlerFuture {
        (self.0)(request, response)
    }
}

/// A registered virtual host: name, application, response filters.
pub struct Vhost {
    name: String,
    handler: Arc<dyn Handler>,
    filters: Vec<Arc<dyn FilterFactory>>,
}

impl Vhost {
    /// Creates a vhost.
    #[must_use]
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            handler,
            filters: Vec::new(),
        }
    }

    /// Registers a response filter factory on this vhost.
    #[must_use]
    pub fn with_filter(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.filters.push(factory);
        self
    }

    /// The vhost name matched against `Host`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The application handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// The vhost's filter factories.
    #[must_use]
    pub fn filters(&self) -> &[Arc<dyn FilterFactory>] {
        &self.filters
    }
}

impl std::fmt::Debug for Vhost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vhost")
            .field("name", &self.name)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Picks the vhost for a request. Failure means 400 Invalid Host.
pub trait HostSelector: Send + Sync {
    /// Selects among `hosts` for the given `Host` header value (port
    /// already stripped) arriving on `local`, returning the index of the
    /// chosen vhost.
    fn select(&self, hosts: &[Vhost], host: Option<&str>, local: &Endpoint) -> Option<usize>;
}

/// Default selector: exact, case-insensitive name match. A missing host
/// only resolves when a single vhost is registered.
#[derive(Debug, Default)]
pub struct ExactHostSelector;

impl HostSelector for ExactHostSelector {
    fn select(&self, hosts: &[Vhost], host: Option<&str>, _local: &Endpoint) -> Option<usize> {
        match host {
            Some(name) => hosts.iter().position(|v| v.name().eq_ignore_ascii_case(name)),
            None if hosts.len() == 1 => Some(0),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::response::StatusCode;

    fn noop_vhost(name: &str) -> Vhost {
        Vhost::new(
            name,
            Arc::new(FnHandler(|_req, res: Responder| -> HandlerFuture {
                Box::pin(async move {
                    res.set_status(StatusCode::OK)?;
                    Ok(())
                })
            })),
        )
    }

    #[test]
    fn exact_selector_matches_case_insensitively() {
        let hosts = vec![noop_vhost("example.com"), noop_vhost("other.net")];
        let selector = ExactHostSelector;
        let local = Endpoint::Tcp("127.0.0.1:80".parse().unwrap());

        assert_eq!(selector.select(&hosts, Some("EXAMPLE.com"), &local), Some(0));
        assert_eq!(selector.select(&hosts, Some("other.net"), &local), Some(1));
        assert!(selector.select(&hosts, Some("missing.org"), &local).is_none());
    }

    #[test]
    fn missing_host_needs_single_vhost() {
        let selector = ExactHostSelector;
        let local = Endpoint::Tcp("127.0.0.1:80".parse().unwrap());

        let one = vec![noop_vhost("example.com")];
        assert!(selector.select(&one, None, &local).is_some());

        let two = vec![noop_vhost("a.com"), noop_vhost("b.com")];
        assert!(selector.select(&two, None, &local).is_none());
    }

    #[test]
    fn app_error_classifies_disconnects() {
        let e: AppError = BodyError::Disconnected.into();
        assert!(matches!(e, AppError::Disconnect));

        let e: AppError = BodyError::Io("reset".to_string()).into();
        assert!(matches!(e, AppError::Failure(_)));

        let e: AppError = RespondError::Disconnected.into();
        assert!(matches!(e, AppError::Disconnect));
    }
}

//! Server configuration record.
//!
//! [`Options`] is a statically typed record with builder-style constructors.
//! When the server transitions to STARTING it calls [`Options::freeze`];
//! from then on every `set_*` mutator fails with [`OptionsError::Frozen`],
//! so a running server cannot observe a half-updated configuration.

use serde::{Deserialize, Serialize};

use crate::http::Method;

/// Default global connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
/// Default per-IP-block connection cap.
pub const DEFAULT_CONNECTIONS_PER_IP: usize = 32;
/// Default keep-alive budget per connection.
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u32 = 100;
/// Default idle keep-alive interval in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default listen backlog.
pub const DEFAULT_SOCKET_BACKLOG_SIZE: u32 = 128;
/// Default maximum bytes consumed per read.
pub const DEFAULT_IO_GRANULARITY: usize = 16 * 1024;
/// Default soft write-buffer cap (backpressure threshold).
pub const DEFAULT_SOFT_STREAM_CAP: usize = 128 * 1024;
/// Default hard write-buffer cap.
pub const DEFAULT_HARD_STREAM_CAP: usize = 1024 * 1024;
/// Default stop deadline in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Error returned by `set_*` mutators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// The record was frozen at STARTING; the named field cannot change.
    Frozen(&'static str),
    /// A value failed validation.
    Invalid {
        /// Field that rejected the value.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen(field) => write!(f, "options are frozen; cannot set `{field}`"),
            Self::Invalid { field, reason } => write!(f, "invalid `{field}`: {reason}"),
        }
    }
}

impl std::error::Error for OptionsError {}

/// Validated, lockable configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    max_connections: usize,
    connections_per_ip: usize,
    max_requests_per_connection: u32,
    connection_timeout: u64,
    socket_backlog_size: u32,
    io_granularity: usize,
    soft_stream_cap: usize,
    hard_stream_cap: usize,
    allowed_methods: Vec<Method>,
    normalize_method_case: bool,
    shutdown_timeout: u64,
    debug: bool,
    user: Option<String>,
    #[serde(skip)]
    frozen: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connections_per_ip: DEFAULT_CONNECTIONS_PER_IP,
            max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SECS,
            socket_backlog_size: DEFAULT_SOCKET_BACKLOG_SIZE,
            io_granularity: DEFAULT_IO_GRANULARITY,
            soft_stream_cap: DEFAULT_SOFT_STREAM_CAP,
            hard_stream_cap: DEFAULT_HARD_STREAM_CAP,
            allowed_methods: vec![
                Method::Get,
                Method::Head,
                Method::Post,
                Method::Put,
                Method::Delete,
                Method::Patch,
                Method::Options,
                Method::Trace,
            ],
            normalize_method_case: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            debug: false,
            user: None,
            frozen: false,
        }
    }
}

macro_rules! checked_setter {
    ($(#[$doc:meta])* $setter:ident, $field:ident: $ty:ty) => {
        $(#[$doc])*
        pub fn $setter(&mut self, value: $ty) -> Result<(), OptionsError> {
            self.check_unfrozen(stringify!($field))?;
            self.$field = value;
            Ok(())
        }
    };
}

impl Options {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unfrozen(&self, field: &'static str) -> Result<(), OptionsError> {
        if self.frozen {
            Err(OptionsError::Frozen(field))
        } else {
            Ok(())
        }
    }

    /// Locks the record against further mutation. Called at STARTING.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the record is locked.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // Builder-style constructors, used before the server takes ownership.

    /// Sets the global connection cap.
    #[must_use]
    pub fn with_max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    /// Sets the per-IP-block connection cap.
    #[must_use]
    pub fn with_connections_per_ip(mut self, value: usize) -> Self {
        self.connections_per_ip = value;
        self
    }

    /// Sets the keep-alive budget granted to each connection.
    #[must_use]
    pub fn with_max_requests_per_connection(mut self, value: u32) -> Self {
        self.max_requests_per_connection = value;
        self
    }

    /// Sets the idle keep-alive interval in seconds.
    #[must_use]
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout = secs;
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn with_socket_backlog_size(mut self, value: u32) -> Self {
        self.socket_backlog_size = value;
        self
    }

    /// Sets the maximum bytes consumed per read.
    #[must_use]
    pub fn with_io_granularity(mut self, value: usize) -> Self {
        self.io_granularity = value.max(1);
        self
    }

    /// Sets the backpressure thresholds. `soft` is clamped to `hard`.
    #[must_use]
    pub fn with_stream_caps(mut self, soft: usize, hard: usize) -> Self {
        self.soft_stream_cap = soft.min(hard);
        self.hard_stream_cap = hard;
        self
    }

    /// Replaces the method whitelist.
    #[must_use]
    pub fn with_allowed_methods(mut self, methods: Vec<Method>) -> Self {
        self.allowed_methods = methods;
        self
    }

    /// Enables or disables method case normalization before dispatch.
    #[must_use]
    pub fn with_normalize_method_case(mut self, enabled: bool) -> Self {
        self.normalize_method_case = enabled;
        self
    }

    /// Sets the stop deadline in seconds.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout = secs;
        self
    }

    /// Enables debug mode (verbose error bodies, reuseport disabled).
    #[must_use]
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Sets the POSIX user to drop privileges to after binding.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    // Fallible mutators, honoring the freeze.

    checked_setter!(
        /// Sets the global connection cap.
        set_max_connections, max_connections: usize
    );
    checked_setter!(
        /// Sets the per-IP-block connection cap.
        set_connections_per_ip, connections_per_ip: usize
    );
    checked_setter!(
        /// Sets the keep-alive budget granted to each connection.
        set_max_requests_per_connection, max_requests_per_connection: u32
    );
    checked_setter!(
        /// Sets the idle keep-alive interval in seconds.
        set_connection_timeout, connection_timeout: u64
    );
    checked_setter!(
        /// Sets the method whitelist.
        set_allowed_methods, allowed_methods: Vec<Method>
    );
    checked_setter!(
        /// Sets the stop deadline in seconds.
        set_shutdown_timeout, shutdown_timeout: u64
    );
    checked_setter!(
        /// Enables debug mode.
        set_debug, debug: bool
    );

    /// Sets the backpressure thresholds.
    pub fn set_stream_caps(&mut self, soft: usize, hard: usize) -> Result<(), OptionsError> {
        self.check_unfrozen("soft_stream_cap")?;
        if soft > hard {
            return Err(OptionsError::Invalid {
                field: "soft_stream_cap",
                reason: "soft cap exceeds hard cap",
            });
        }
        self.soft_stream_cap = soft;
        self.hard_stream_cap = hard;
        Ok(())
    }

    // Accessors.

    /// Global admission cap (inclusive).
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Per-IP-block cap (inclusive; IPv6 aggregated to /56).
    #[must_use]
    pub fn connections_per_ip(&self) -> usize {
        self.connections_per_ip
    }

    /// Initial keep-alive budget.
    #[must_use]
    pub fn max_requests_per_connection(&self) -> u32 {
        self.max_requests_per_connection
    }

    /// Idle keep-alive interval in seconds.
    #[must_use]
    pub fn connection_timeout(&self) -> u64 {
        self.connection_timeout
    }

    /// Listen backlog.
    #[must_use]
    pub fn socket_backlog_size(&self) -> u32 {
        self.socket_backlog_size
    }

    /// Maximum bytes per read.
    #[must_use]
    pub fn io_granularity(&self) -> usize {
        self.io_granularity
    }

    /// Backpressure threshold: suspend producers above this buffer size.
    #[must_use]
    pub fn soft_stream_cap(&self) -> usize {
        self.soft_stream_cap
    }

    /// Writes past this buffer size indicate a driver bug.
    #[must_use]
    pub fn hard_stream_cap(&self) -> usize {
        self.hard_stream_cap
    }

    /// Enumerated method whitelist.
    #[must_use]
    pub fn allowed_methods(&self) -> &[Method] {
        &self.allowed_methods
    }

    /// Whether method tokens are upper-cased before dispatch.
    #[must_use]
    pub fn normalize_method_case(&self) -> bool {
        self.normalize_method_case
    }

    /// Stop deadline in seconds.
    #[must_use]
    pub fn shutdown_timeout(&self) -> u64 {
        self.shutdown_timeout
    }

    /// Debug mode.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// POSIX user to drop privileges to, if any.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let opts = Options::new()
            .with_max_connections(2)
            .with_connections_per_ip(1)
            .with_connection_timeout(5)
            .with_stream_caps(10, 20)
            .with_debug(true);

        assert_eq!(opts.max_connections(), 2);
        assert_eq!(opts.connections_per_ip(), 1);
        assert_eq!(opts.connection_timeout(), 5);
        assert_eq!(opts.soft_stream_cap(), 10);
        assert_eq!(opts.hard_stream_cap(), 20);
        assert!(opts.debug());
    }

    #[test]
    fn soft_cap_clamped_to_hard() {
        let opts = Options::new().with_stream_caps(50, 20);
        assert_eq!(opts.soft_stream_cap(), 20);
        assert_eq!(opts.hard_stream_cap(), 20);
    }

    #[test]
    fn setters_work_until_frozen() {
        let mut opts = Options::new();
        opts.set_max_connections(7).unwrap();
        assert_eq!(opts.max_connections(), 7);

        opts.freeze();
        assert!(opts.is_frozen());
        assert_eq!(
            opts.set_max_connections(8),
            Err(OptionsError::Frozen("max_connections"))
        );
        assert_eq!(opts.max_connections(), 7);
    }

    #[test]
    fn stream_cap_validation() {
        let mut opts = Options::new();
        assert!(opts.set_stream_caps(10, 5).is_err());
        assert!(opts.set_stream_caps(5, 10).is_ok());
    }

    #[test]
    fn frozen_flag_survives_clone() {
        let mut opts = Options::new();
        opts.freeze();
        assert!(opts.clone().is_frozen());
    }

    #[test]
    fn default_whitelist_covers_trace_and_options() {
        let opts = Options::new();
        assert!(opts.allowed_methods().contains(&Method::Trace));
        assert!(opts.allowed_methods().contains(&Method::Options));
    }
}

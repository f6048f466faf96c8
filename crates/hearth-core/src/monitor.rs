//! Read-only runtime snapshot.

use serde::Serialize;

use crate::lifecycle::ServerState;

/// Point-in-time view of server state, safe to serialize and ship.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Lifecycle state at capture time.
    pub state: ServerState,
    /// Bound listener addresses, as displayable strings.
    pub bindings: Vec<String>,
    /// Live client connections.
    pub clients: usize,
    /// Distinct IP blocks with at least one connection.
    pub unique_ip_blocks: usize,
    /// Sockets still negotiating TLS.
    pub pending_inputs: usize,
    /// Registered virtual host names.
    pub hosts: Vec<String>,
}

//! Test doubles for the connection core: scripted transports and
//! listeners, and an injectable binder producing them.
//!
//! Everything here is deterministic: tests push bytes in, pump the
//! server's event surface, and read the wire bytes back out.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::listener::{BindError, Binder, Endpoint, ListenerSocket, SocketContext};
use crate::transport::Transport;

struct MockState {
    input: VecDeque<u8>,
    eof: bool,
    written: Vec<u8>,
    write_limit: Option<usize>,
    fail_writes: bool,
    shutdown: bool,
}

/// Scripted transport half handed to the server.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle to a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

/// Creates a connected transport/handle pair.
#[must_use]
pub fn mock_transport() -> (MockTransport, MockHandle) {
    let state = Arc::new(Mutex::new(MockState {
        input: VecDeque::new(),
        eof: false,
        written: Vec::new(),
        write_limit: None,
        fail_writes: false,
        shutdown: false,
    }));
    (
        MockTransport {
            state: Arc::clone(&state),
        },
        MockHandle { state },
    )
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.input.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.input.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = state.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown(&mut self) {
        self.state.lock().shutdown = true;
    }
}

impl MockHandle {
    /// Queues bytes the server will read.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
    }

    /// Marks EOF after any queued bytes.
    pub fn set_eof(&self) {
        self.state.lock().eof = true;
    }

    /// Everything the server has written so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Written bytes decoded as UTF-8.
    #[must_use]
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().written).into_owned()
    }

    /// Caps how many bytes each write accepts (simulates a slow peer).
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    /// Makes subsequent writes fail (peer reset).
    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    /// True once the server shut the socket down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

type AcceptQueue = Arc<Mutex<VecDeque<(Box<dyn Transport>, Endpoint)>>>;

/// Scripted listener: accepts whatever the test enqueued.
pub struct MockListener {
    endpoint: Endpoint,
    queue: AcceptQueue,
}

impl ListenerSocket for MockListener {
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Endpoint)>> {
        Ok(self.queue.lock().pop_front())
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

type ListenerRegistry = Arc<Mutex<HashMap<Endpoint, AcceptQueue>>>;

/// Binder producing [`MockListener`]s; the paired handle reaches their
/// accept queues after the server started.
pub struct MockBinder {
    registry: ListenerRegistry,
}

/// Test-side handle to every listener a [`MockBinder`] produced.
#[derive(Clone)]
pub struct MockBinderHandle {
    registry: ListenerRegistry,
}

impl MockBinder {
    /// Creates a binder and its handle.
    #[must_use]
    pub fn new() -> (Self, MockBinderHandle) {
        let registry: ListenerRegistry = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                registry: Arc::clone(&registry),
            },
            MockBinderHandle { registry },
        )
    }
}

impl Binder for MockBinder {
    fn bind(
        &mut self,
        contexts: &HashMap<Endpoint, SocketContext>,
    ) -> Result<HashMap<Endpoint, Box<dyn ListenerSocket>>, BindError> {
        let mut bound: HashMap<Endpoint, Box<dyn ListenerSocket>> = HashMap::new();
        for endpoint in contexts.keys() {
            let queue: AcceptQueue = Arc::new(Mutex::new(VecDeque::new()));
            self.registry
                .lock()
                .insert(endpoint.clone(), Arc::clone(&queue));
            bound.insert(
                endpoint.clone(),
                Box::new(MockListener {
                    endpoint: endpoint.clone(),
                    queue,
                }),
            );
        }
        Ok(bound)
    }
}

impl MockBinderHandle {
    /// Enqueues a connection for the listener bound at `endpoint`.
    ///
    /// # Panics
    ///
    /// Panics when no listener was bound there (the binder never ran).
    pub fn enqueue(&self, endpoint: &Endpoint, transport: Box<dyn Transport>, peer: Endpoint) {
        let registry = self.registry.lock();
        let queue = registry
            .get(endpoint)
            .expect("endpoint was never bound");
        queue.lock().push_back((transport, peer));
    }
}

/// Runs a future on a fresh single-threaded runtime.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("runtime must build");
    rt.block_on(future)
}

//! End-to-end scenarios for the connection core, driven deterministically
//! through the server's event surface with scripted transports.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::Waker;

use hearth_core::lifecycle::{Observer, ObserverError, ObserverFuture, ServerState};
use hearth_core::logging::{CaptureSink, LogLevel, Logger};
use hearth_core::options::Options;
use hearth_core::Method;
use hearth_core::Ticker;
use hearth_http::testing::{block_on, mock_transport, MockBinder, MockBinderHandle, MockHandle};
use hearth_http::{
    AppError, Endpoint, FnHandler, Handler, HandlerFuture, Responder, Server, SocketContext,
    StartError, Vhost,
};
use parking_lot::Mutex;

fn test_endpoint() -> Endpoint {
    Endpoint::Tcp("127.0.0.1:8080".parse().unwrap())
}

fn peer(addr: &str) -> Endpoint {
    Endpoint::Tcp(addr.parse().unwrap())
}

fn ok_handler() -> Arc<dyn Handler> {
    Arc::new(FnHandler(|_req, res: Responder| -> HandlerFuture {
        Box::pin(async move {
            res.set_header("content-length", b"2".to_vec())?;
            res.end(Some(b"ok".to_vec())).await?;
            Ok(())
        })
    }))
}

fn pending_handler() -> Arc<dyn Handler> {
    Arc::new(FnHandler(|_req, _res: Responder| -> HandlerFuture {
        Box::pin(std::future::pending::<Result<(), AppError>>())
    }))
}

struct Harness {
    server: Server,
    binder: MockBinderHandle,
    endpoint: Endpoint,
}

impl Harness {
    fn new(options: Options, handler: Arc<dyn Handler>) -> Self {
        let endpoint = test_endpoint();
        let (binder, handle) = MockBinder::new();
        let mut server = Server::new(options)
            .with_ticker(Ticker::new(0))
            .with_binder(Box::new(binder))
            .with_logger(Logger::new(LogLevel::Error, Arc::new(CaptureSink::new())));
        server.bind(endpoint.clone(), SocketContext::plaintext(&Options::new()));
        server.add_host(Vhost::new("example.com", handler));
        Self {
            server,
            binder: handle,
            endpoint,
        }
    }

    fn start(&mut self) {
        block_on(self.server.start()).expect("server must start");
    }

    /// Enqueues and accepts one connection. `None` when admission denied
    /// (or accepting stopped).
    fn connect(&mut self, peer_addr: &str) -> Option<(u64, MockHandle)> {
        let (transport, handle) = mock_transport();
        self.binder
            .enqueue(&self.endpoint, Box::new(transport), peer(peer_addr));

        let before: HashSet<u64> = self.server.connection_ids().into_iter().collect();
        let endpoint = self.endpoint.clone();
        self.server.handle_accept(&endpoint);

        let id = self
            .server
            .connection_ids()
            .into_iter()
            .find(|id| !before.contains(id))?;
        Some((id, handle))
    }

    fn send(&mut self, id: u64, handle: &MockHandle, bytes: &[u8]) {
        handle.push_input(bytes);
        self.server.handle_readable(id);
    }

    fn drain(&mut self, id: u64) {
        self.server.handle_writable(id);
    }
}

// ---------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------

#[test]
fn global_cap_denies_the_third_connection() {
    let options = Options::new()
        .with_max_connections(2)
        .with_connections_per_ip(100);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    let (first, _h1) = harness.connect("10.0.0.1:1000").expect("first admitted");
    harness.connect("10.0.0.2:1000").expect("second admitted");

    // the third crosses the cap: closed with no state created
    let (transport, third) = mock_transport();
    harness
        .binder
        .enqueue(&test_endpoint(), Box::new(transport), peer("10.0.0.3:1000"));
    let endpoint = test_endpoint();
    harness.server.handle_accept(&endpoint);

    assert!(third.is_shutdown());
    assert_eq!(harness.server.snapshot().clients, 2);

    // freeing a slot re-opens admission
    harness.server.close_client(first);
    assert!(harness.connect("10.0.0.4:1000").is_some());
}

#[test]
fn per_ip_cap_is_per_block() {
    let options = Options::new()
        .with_max_connections(100)
        .with_connections_per_ip(1);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    assert!(harness.connect("10.0.0.1:1000").is_some());
    assert!(harness.connect("10.0.0.1:2000").is_none());
    // a different address is a different block
    assert!(harness.connect("10.0.0.2:1000").is_some());
    assert_eq!(harness.server.snapshot().unique_ip_blocks, 2);
}

#[test]
fn import_then_close_restores_counters() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();

    let (id, _handle) = harness.connect("10.0.0.1:1000").unwrap();
    assert_eq!(harness.server.snapshot().unique_ip_blocks, 1);

    harness.server.close_client(id);
    let snapshot = harness.server.snapshot();
    assert_eq!(snapshot.clients, 0);
    assert_eq!(snapshot.unique_ip_blocks, 0);
}

// ---------------------------------------------------------------------
// Keep-alive expiry
// ---------------------------------------------------------------------

#[test]
fn idle_connection_expires_and_streaming_one_is_spared() {
    let options = Options::new()
        .with_connection_timeout(5)
        .with_max_requests_per_connection(100);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    let (idle, idle_handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        idle,
        &idle_handle,
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );
    harness.drain(idle);
    assert!(idle_handle.written_text().starts_with("HTTP/1.1 200 OK"));

    harness.server.tick(6);
    assert!(
        !harness.server.connection_ids().contains(&idle),
        "idle connection must be closed by the sweep"
    );
    assert!(idle_handle.is_shutdown());
}

#[test]
fn busy_connection_survives_the_sweep() {
    let options = Options::new().with_connection_timeout(5);
    let mut harness = Harness::new(options, pending_handler());
    harness.start();

    let (busy, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        busy,
        &handle,
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );

    harness.server.tick(6);
    assert!(
        harness.server.connection_ids().contains(&busy),
        "a connection still producing a response is busy, not idle"
    );
}

// ---------------------------------------------------------------------
// Graceful stop
// ---------------------------------------------------------------------

struct GateShared {
    open: bool,
    waker: Option<Waker>,
}

#[derive(Clone)]
struct GateControl {
    shared: Arc<Mutex<GateShared>>,
}

impl GateControl {
    fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(GateShared {
                open: false,
                waker: None,
            })),
        }
    }

    fn open(&self) {
        let mut shared = self.shared.lock();
        shared.open = true;
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }

    fn wait(&self) -> GateFuture {
        GateFuture {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct GateFuture {
    shared: Arc<Mutex<GateShared>>,
}

impl std::future::Future for GateFuture {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut shared = self.shared.lock();
        if shared.open {
            std::task::Poll::Ready(())
        } else {
            shared.waker = Some(cx.waker().clone());
            std::task::Poll::Pending
        }
    }
}

fn gated_handler(gate: GateControl) -> Arc<dyn Handler> {
    Arc::new(FnHandler(move |_req, res: Responder| -> HandlerFuture {
        let gate = gate.clone();
        Box::pin(async move {
            gate.wait().await;
            res.set_header("content-length", b"4".to_vec())?;
            res.end(Some(b"done".to_vec())).await?;
            Ok(())
        })
    }))
}

#[test]
fn graceful_stop_drains_the_in_flight_request() {
    let gate = GateControl::new();
    let mut harness = Harness::new(Options::new(), gated_handler(gate.clone()));
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

    let stop_wait = harness.server.stop().expect("stop from STARTED");
    assert_eq!(harness.server.state(), ServerState::Stopping);
    assert!(!harness.server.is_accepting());

    // new connections are no longer accepted
    assert!(harness.connect("10.0.0.9:1000").is_none());
    assert_eq!(harness.server.snapshot().clients, 1);

    // the in-flight request completes and drains
    gate.open();
    harness.server.drive();
    harness.drain(id);

    assert!(handle.written_text().contains("done"));
    assert_eq!(harness.server.state(), ServerState::Stopped);
    assert_eq!(harness.server.snapshot().clients, 0);
    assert!(block_on(stop_wait).is_ok());
}

#[test]
fn stop_is_a_noop_from_stopped() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    // never started
    assert!(block_on(async { harness.server.stop().unwrap().await }).is_ok());
    assert!(block_on(async { harness.server.stop().unwrap().await }).is_ok());
    assert_eq!(harness.server.state(), ServerState::Stopped);
}

#[test]
fn stop_times_out_when_a_client_never_drains() {
    let options = Options::new().with_shutdown_timeout(10);
    let mut harness = Harness::new(options, pending_handler());
    harness.start();

    let (_id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        _id,
        &handle,
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );

    let stop_wait = harness.server.stop().expect("stop from STARTED");
    assert_eq!(harness.server.state(), ServerState::Stopping);

    harness.server.tick(11);
    assert_eq!(harness.server.state(), ServerState::Stopped);
    assert_eq!(block_on(stop_wait), Err(hearth_http::StopError::Timeout));
}

// ---------------------------------------------------------------------
// Pre-app fast paths
// ---------------------------------------------------------------------

#[test]
fn trace_echoes_the_request_head() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        id,
        &handle,
        b"TRACE /x HTTP/1.1\r\nHost: example.com\r\nX-Probe: 1\r\n\r\n",
    );
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-type: message/http\r\n"));

    let (_, body) = text.split_once("\r\n\r\n").expect("head/body split");
    assert!(body.starts_with("TRACE /x HTTP/1.1\r\n"));
    assert!(body.contains("host: example.com\r\n"));
    assert!(body.contains("x-probe: 1\r\n"));
}

#[test]
fn unmatched_host_yields_400_and_closes() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        id,
        &handle,
        b"GET / HTTP/1.1\r\nHost: nowhere.example\r\n\r\n",
    );
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request: Invalid Host\r\n"));
    assert!(text.contains("connection: close\r\n"));
    assert!(!harness.server.connection_ids().contains(&id));
    assert!(handle.is_shutdown());
}

#[test]
fn disallowed_method_yields_405_with_allow() {
    let options = Options::new().with_allowed_methods(vec![Method::Get, Method::Head]);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        id,
        &handle,
        b"DELETE / HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(text.contains("allow: GET, HEAD\r\n"));
}

#[test]
fn options_star_lists_allowed_methods() {
    let options = Options::new().with_allowed_methods(vec![Method::Get, Method::Options]);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(
        id,
        &handle,
        b"OPTIONS * HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("allow: GET, OPTIONS\r\n"));
}

#[test]
fn parse_error_answers_with_connection_close() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"NOT A REQUEST LINE AT ALL\r\n\r\n");
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 400 "));
    assert!(text.contains("connection: close\r\n"));
    assert!(!harness.server.connection_ids().contains(&id));
}

// ---------------------------------------------------------------------
// Application responses
// ---------------------------------------------------------------------

#[test]
fn handler_response_reaches_the_wire_and_renews_keepalive() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("ok"));
    // still alive for the next request
    assert!(harness.server.connection_ids().contains(&id));
    assert!(harness.server.wants_read(id));
}

#[test]
fn handler_without_response_yields_404() {
    let silent: Arc<dyn Handler> = Arc::new(FnHandler(|_req, _res: Responder| -> HandlerFuture {
        Box::pin(async { Ok(()) })
    }));
    let mut harness = Harness::new(Options::new(), silent);
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(text.contains("404 Not Found"));
}

#[test]
fn failing_handler_yields_500_with_debug_detail() {
    let failing: Arc<dyn Handler> = Arc::new(FnHandler(|_req, _res: Responder| -> HandlerFuture {
        Box::pin(async { Err(AppError::Failure("kaboom <tag>".to_string())) })
    }));
    let mut harness = Harness::new(Options::new().with_debug(true), failing);
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    // debug detail present and HTML-escaped
    assert!(text.contains("kaboom &lt;tag&gt;"));
}

#[test]
fn streaming_write_suspends_on_the_soft_cap() {
    let options = Options::new().with_stream_caps(8, 1 << 20);
    let streaming: Arc<dyn Handler> = Arc::new(FnHandler(|_req, res: Responder| -> HandlerFuture {
        Box::pin(async move {
            res.write(vec![b'x'; 100]).await?;
            res.end(None).await?;
            Ok(())
        })
    }));
    let mut harness = Harness::new(options, streaming);
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    harness.send(id, &handle, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

    // the first write crossed the soft cap: producer is suspended, bytes
    // are buffered, nothing on the wire yet
    assert!(handle.written().is_empty());
    assert!(harness.server.wants_write(id));

    // draining resumes the producer and finishes the response
    harness.drain(id);
    harness.drain(id);

    let text = handle.written_text();
    assert!(text.contains(&"x".repeat(100)));
    assert!(text.ends_with("0\r\n\r\n"));
}

// ---------------------------------------------------------------------
// Lifecycle and observers
// ---------------------------------------------------------------------

struct RecordingObserver {
    seen: Mutex<Vec<ServerState>>,
    fail_on: Option<ServerState>,
}

impl RecordingObserver {
    fn new(fail_on: Option<ServerState>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail_on,
        })
    }
}

impl Observer for RecordingObserver {
    fn update(&self, state: ServerState) -> ObserverFuture {
        self.seen.lock().push(state);
        let fail = self.fail_on == Some(state);
        Box::pin(async move {
            if fail {
                Err(ObserverError::new("observer refused"))
            } else {
                Ok(())
            }
        })
    }
}

#[test]
fn start_requires_a_registered_host() {
    let (binder, _handle) = MockBinder::new();
    let mut server = Server::new(Options::new())
        .with_ticker(Ticker::new(0))
        .with_binder(Box::new(binder));
    server.bind(test_endpoint(), SocketContext::plaintext(&Options::new()));

    let result = block_on(server.start());
    assert!(matches!(result, Err(StartError::NoHosts)));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn observer_failure_at_starting_is_fatal() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness
        .server
        .attach(RecordingObserver::new(Some(ServerState::Starting)));

    let result = block_on(harness.server.start());
    assert!(matches!(result, Err(StartError::Observers(_))));
    assert_eq!(harness.server.state(), ServerState::Stopped);
}

#[test]
fn observers_see_the_full_lifecycle() {
    let observer = RecordingObserver::new(None);
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.server.attach(observer.clone());

    harness.start();
    let stop_wait = harness.server.stop().expect("stop from STARTED");
    assert!(block_on(stop_wait).is_ok());

    assert_eq!(
        *observer.seen.lock(),
        vec![
            ServerState::Starting,
            ServerState::Started,
            ServerState::Stopping,
            ServerState::Stopped,
        ]
    );
}

#[test]
fn options_are_frozen_after_start() {
    let mut harness = Harness::new(Options::new(), ok_handler());
    harness.start();
    assert!(harness.server.options().is_frozen());
    assert!(harness.server.options_mut().set_max_connections(1).is_err());
}

// ---------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------

#[test]
fn export_keeps_the_socket_and_counters_until_disposed() {
    let options = Options::new().with_connections_per_ip(1);
    let mut harness = Harness::new(options, ok_handler());
    harness.start();

    let (id, handle) = harness.connect("10.0.0.1:1000").unwrap();
    let exported = harness.server.export(id).expect("export live connection");

    // gone from bookkeeping, but the socket is untouched
    assert_eq!(harness.server.snapshot().clients, 0);
    assert!(!handle.is_shutdown());

    // the block slot is still held by the upgrader
    assert!(harness.connect("10.0.0.1:2000").is_none());

    drop(exported);
    assert!(harness.connect("10.0.0.1:2000").is_some());
}

//! The server: lifecycle orchestration, the connection table, and the
//! event surface the loop drives.
//!
//! One thread owns a [`Server`]. The embedding event loop calls
//! [`handle_accept`](Server::handle_accept),
//! [`handle_readable`](Server::handle_readable),
//! [`handle_writable`](Server::handle_writable) and
//! [`tick`](Server::tick), and queries per-connection interest with
//! [`wants_read`](Server::wants_read)/[`wants_write`](Server::wants_write)
//! after each call. Handler futures run on an internal task list; the
//! server polls them whenever an event may have unblocked one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use hearth_core::clock::Ticker;
use hearth_core::http::{format_allow_header, HttpVersion, Method};
use hearth_core::lifecycle::{
    transition, NotifyAll, Observer, ObserverError, ObserverHandle, ObserverSet, ServerState,
};
use hearth_core::logging::{LogEntry, LogLevel, Logger};
use hearth_core::monitor::Snapshot;
use hearth_core::options::Options;
use hearth_core::request::{BodyError, Request, RequestBody, StreamedBody};
use hearth_core::response::{default_error_body, ResponseState, StatusCode};
use parking_lot::Mutex;

use crate::admission::{AdmissionCounters, IpBlock};
use crate::body::BodyEmitter;
use crate::client::{Client, ConnSink, DrainAction};
use crate::driver::{HttpDriver, ParserEvent, RequestHead};
use crate::h1::Http1Driver;
use crate::keepalive::KeepAliveQueue;
use crate::listener::{BindError, Binder, Endpoint, ListenerSocket, SocketContext, StdBinder};
use crate::pipeline::{AppError, HandlerFuture, HostSelector, ExactHostSelector, Vhost};
use crate::respond::{send_fixed, send_with_recovery, FilterFactory, FixedResponse, Responder};
use crate::tls::{HandshakeStatus, TlsHandshake, TlsInfo};
use crate::transport::Transport;

/// Failure starting the server.
#[derive(Debug)]
pub enum StartError {
    /// `start` is only permitted from STOPPED.
    InvalidState(ServerState),
    /// No virtual host is registered.
    NoHosts,
    /// No bind address is registered.
    NoBindings,
    /// The binder failed.
    Bind(BindError),
    /// One or more observers rejected the startup transition.
    Observers(Vec<(ObserverHandle, ObserverError)>),
    /// The configured user could not be assumed.
    User(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "cannot start from {state}"),
            Self::NoHosts => write!(f, "no virtual hosts registered"),
            Self::NoBindings => write!(f, "no bind addresses registered"),
            Self::Bind(e) => write!(f, "{e}"),
            Self::Observers(failures) => {
                write!(f, "{} observer(s) failed startup", failures.len())
            }
            Self::User(msg) => write!(f, "cannot drop privileges: {msg}"),
        }
    }
}

impl std::error::Error for StartError {}

/// Failure stopping the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopError {
    /// `stop` fails from STARTING and STOPPING.
    InvalidState(ServerState),
    /// The drain did not finish within `shutdown_timeout`. The server is
    /// halted regardless.
    Timeout,
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "cannot stop from {state}"),
            Self::Timeout => write!(f, "shutdown timed out"),
        }
    }
}

impl std::error::Error for StopError {}

/// Failure exporting a connection.
#[derive(Debug)]
pub enum ExportError {
    /// No live connection has this id.
    UnknownConnection(u64),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownConnection(id) => write!(f, "no connection {id}"),
        }
    }
}

impl std::error::Error for ExportError {}

/// Drops process privileges to a named user at startup.
pub trait UserSwitcher: Send {
    /// Switches the effective user.
    ///
    /// # Errors
    ///
    /// A message describing why the user cannot be assumed.
    fn switch(&mut self, user: &str) -> Result<(), String>;
}

/// POSIX implementation via getpwnam/setgid/setuid.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct PosixUserSwitcher;

#[cfg(unix)]
impl UserSwitcher for PosixUserSwitcher {
    fn switch(&mut self, user: &str) -> Result<(), String> {
        let name = std::ffi::CString::new(user).map_err(|_| "user name contains NUL".to_string())?;
        let entry = unsafe { libc::getpwnam(name.as_ptr()) };
        if entry.is_null() {
            return Err(format!("unknown user `{user}`"));
        }
        let (uid, gid) = unsafe { ((*entry).pw_uid, (*entry).pw_gid) };
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }
        Ok(())
    }
}

/// Fallback switcher for platforms without user switching.
#[derive(Debug, Default)]
pub struct NoUserSwitcher;

impl UserSwitcher for NoUserSwitcher {
    fn switch(&mut self, user: &str) -> Result<(), String> {
        Err(format!(
            "user switching is unavailable on this platform (requested `{user}`)"
        ))
    }
}

#[cfg(unix)]
type DefaultUserSwitcher = PosixUserSwitcher;
#[cfg(not(unix))]
type DefaultUserSwitcher = NoUserSwitcher;

/// Socket and disposer returned by [`Server::export`].
pub struct Exported {
    /// The live socket; the upgrader owns it now.
    pub transport: Box<dyn Transport>,
    /// Peer endpoint.
    pub peer: Endpoint,
    /// Negotiated TLS parameters.
    pub tls: TlsInfo,
    /// Releases the connection's admission slots when dropped (or
    /// explicitly via [`ExportDisposer::dispose`]).
    pub disposer: ExportDisposer,
}

/// Admission bookkeeping handle for an exported socket.
pub struct ExportDisposer {
    admission: Arc<Mutex<AdmissionCounters>>,
    block: Option<IpBlock>,
    released: bool,
}

impl ExportDisposer {
    /// Releases the admission slots now.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.admission.lock().release(self.block);
        }
    }
}

impl Drop for ExportDisposer {
    fn drop(&mut self) {
        self.release();
    }
}

struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl std::task::Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct PendingTls {
    handshake: Box<dyn TlsHandshake>,
    peer: Endpoint,
    local: Endpoint,
    block: Option<IpBlock>,
}

struct TaskEntry {
    conn_id: u64,
    version: HttpVersion,
    future: HandlerFuture,
    responder: Responder,
    filter_factories: Vec<Arc<dyn FilterFactory>>,
    bad_filter_keys: Vec<String>,
    wake: Arc<WakeFlag>,
    started: bool,
}

struct StopShared {
    finished: Option<Result<(), StopError>>,
    wakers: Vec<Waker>,
}

struct StopDriver {
    barrier_done: Option<Result<(), StopError>>,
    stopping_notify: Option<NotifyAll>,
    stopping_done: bool,
    final_notify: Option<NotifyAll>,
    deadline: u64,
    shared: Arc<Mutex<StopShared>>,
    wake: Arc<WakeFlag>,
}

/// Future returned by [`Server::stop`]; resolves once the drain and the
/// observer notifications finish (or the deadline forces the issue).
pub struct StopWait {
    shared: Arc<Mutex<StopShared>>,
}

impl StopWait {
    fn ready(result: Result<(), StopError>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(StopShared {
                finished: Some(result),
                wakers: Vec::new(),
            })),
        }
    }
}

impl Future for StopWait {
    type Output = Result<(), StopError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock();
        if let Some(result) = shared.finished {
            return Poll::Ready(result);
        }
        if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            shared.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// The connection and request-dispatch core.
pub struct Server {
    options: Options,
    logger: Logger,
    ticker: Ticker,
    state: ServerState,
    observers: ObserverSet,
    hosts: Vec<Vhost>,
    host_selector: Arc<dyn HostSelector>,
    default_driver: Arc<dyn HttpDriver>,
    drivers: HashMap<Endpoint, Arc<dyn HttpDriver>>,
    contexts: HashMap<Endpoint, SocketContext>,
    binder: Box<dyn Binder>,
    listeners: HashMap<Endpoint, Box<dyn ListenerSocket>>,
    accepting: bool,
    admission: Arc<Mutex<AdmissionCounters>>,
    clients: HashMap<u64, Client>,
    pending_tls: HashMap<u64, PendingTls>,
    keepalive: KeepAliveQueue,
    tasks: Vec<TaskEntry>,
    next_conn_id: u64,
    stop: Option<StopDriver>,
    user_switcher: Box<dyn UserSwitcher>,
}

impl Server {
    /// Creates a server with the given options and defaults everywhere
    /// else: HTTP/1.1 driver, std binder, exact host selection, stderr
    /// logging, system clock.
    #[must_use]
    pub fn new(options: Options) -> Self {
        let admission = Arc::new(Mutex::new(AdmissionCounters::new(
            options.max_connections(),
            options.connections_per_ip(),
        )));
        Self {
            options,
            logger: Logger::stderr(),
            ticker: Ticker::system(),
            state: ServerState::Stopped,
            observers: ObserverSet::new(),
            hosts: Vec::new(),
            host_selector: Arc::new(ExactHostSelector),
            default_driver: Arc::new(Http1Driver::new()),
            drivers: HashMap::new(),
            contexts: HashMap::new(),
            binder: Box::new(StdBinder),
            listeners: HashMap::new(),
            accepting: false,
            admission,
            clients: HashMap::new(),
            pending_tls: HashMap::new(),
            keepalive: KeepAliveQueue::new(),
            tasks: Vec::new(),
            next_conn_id: 0,
            stop: None,
            user_switcher: Box::new(DefaultUserSwitcher::default()),
        }
    }

    /// Replaces the logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Replaces the clock; tests pin it.
    #[must_use]
    pub fn with_ticker(mut self, ticker: Ticker) -> Self {
        self.ticker = ticker;
        self
    }

    /// Replaces the binder; tests inject scripted listeners.
    #[must_use]
    pub fn with_binder(mut self, binder: Box<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    /// Replaces the host selector.
    #[must_use]
    pub fn with_host_selector(mut self, selector: Arc<dyn HostSelector>) -> Self {
        self.host_selector = selector;
        self
    }

    /// Replaces the default driver.
    #[must_use]
    pub fn with_default_driver(mut self, driver: Arc<dyn HttpDriver>) -> Self {
        self.default_driver = driver;
        self
    }

    /// Replaces the user switcher.
    #[must_use]
    pub fn with_user_switcher(mut self, switcher: Box<dyn UserSwitcher>) -> Self {
        self.user_switcher = switcher;
        self
    }

    /// Registers a virtual host.
    pub fn add_host(&mut self, vhost: Vhost) {
        self.hosts.push(vhost);
    }

    /// Registers a bind address with its socket context.
    pub fn bind(&mut self, endpoint: Endpoint, context: SocketContext) {
        self.contexts.insert(endpoint, context);
    }

    /// Overrides the driver for connections accepted on `endpoint`.
    pub fn set_driver(&mut self, endpoint: Endpoint, driver: Arc<dyn HttpDriver>) {
        self.drivers.insert(endpoint, driver);
    }

    /// Attaches a lifecycle observer.
    pub fn attach(&mut self, observer: Arc<dyn Observer>) -> ObserverHandle {
        self.observers.attach(observer)
    }

    /// Detaches a lifecycle observer.
    pub fn detach(&mut self, handle: ObserverHandle) -> bool {
        self.observers.detach(handle)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The configuration record.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Mutable configuration access; setters fail once frozen.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// The loop clock.
    #[must_use]
    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    /// Read-only runtime snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut bindings: Vec<String> = if self.listeners.is_empty() {
            self.contexts.keys().map(ToString::to_string).collect()
        } else {
            self.listeners.keys().map(ToString::to_string).collect()
        };
        bindings.sort();
        Snapshot {
            state: self.state,
            bindings,
            clients: self.clients.len(),
            unique_ip_blocks: self.admission.lock().unique_blocks(),
            pending_inputs: self.pending_tls.len(),
            hosts: self.hosts.iter().map(|v| v.name().to_string()).collect(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the server: binds listeners, notifies observers, freezes
    /// options, optionally drops privileges, and begins accepting.
    ///
    /// # Errors
    ///
    /// Configuration errors fail fast; observer failures during STARTING
    /// or STARTED tear the server back down and surface as
    /// [`StartError::Observers`].
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.state != ServerState::Stopped {
            return Err(StartError::InvalidState(self.state));
        }
        if self.hosts.is_empty() {
            return Err(StartError::NoHosts);
        }
        if self.contexts.is_empty() {
            return Err(StartError::NoBindings);
        }

        let listeners = self.binder.bind(&self.contexts).map_err(StartError::Bind)?;

        transition(&mut self.state, ServerState::Starting)
            .map_err(|e| StartError::InvalidState(e.from))?;
        self.listeners = listeners;

        let outcome = self.observers.notify(ServerState::Starting).await;
        if !outcome.is_ok() {
            self.log_observer_failures(ServerState::Starting, outcome.failures());
            self.teardown_failed_start();
            return Err(StartError::Observers(outcome.into_failures()));
        }

        self.options.freeze();

        if let Some(user) = self.options.user().map(str::to_string) {
            if let Err(msg) = self.user_switcher.switch(&user) {
                self.teardown_failed_start();
                return Err(StartError::User(msg));
            }
        }

        self.admission = Arc::new(Mutex::new(AdmissionCounters::new(
            self.options.max_connections(),
            self.options.connections_per_ip(),
        )));

        transition(&mut self.state, ServerState::Started)
            .map_err(|e| StartError::InvalidState(e.from))?;
        self.accepting = true;

        let outcome = self.observers.notify(ServerState::Started).await;
        if !outcome.is_ok() {
            self.log_observer_failures(ServerState::Started, outcome.failures());
            // the stop path, with nothing to drain yet
            self.accepting = false;
            self.listeners.clear();
            let _ = transition(&mut self.state, ServerState::Stopping);
            let stopping = self.observers.notify(ServerState::Stopping).await;
            self.log_observer_failures(ServerState::Stopping, stopping.failures());
            let _ = transition(&mut self.state, ServerState::Stopped);
            let stopped = self.observers.notify(ServerState::Stopped).await;
            self.log_observer_failures(ServerState::Stopped, stopped.failures());
            return Err(StartError::Observers(outcome.into_failures()));
        }

        let snapshot = self.snapshot();
        self.logger.log(
            LogEntry::new(LogLevel::Info, "server started")
                .field("bindings", snapshot.bindings.join(","))
                .at(self.ticker.now()),
        );
        Ok(())
    }

    fn teardown_failed_start(&mut self) {
        self.accepting = false;
        self.listeners.clear();
        // startup never completed; fall straight back to STOPPED
        self.state = ServerState::Stopped;
    }

    /// Initiates a graceful stop.
    ///
    /// Synchronously: cancels accepting, closes listeners, aborts pending
    /// handshakes, closes idle connections, and zeroes every keep-alive
    /// budget. The returned [`StopWait`] resolves once live connections
    /// drained and observers were notified; the whole sequence is bounded
    /// by `shutdown_timeout`, enforced from [`tick`](Server::tick).
    ///
    /// # Errors
    ///
    /// No-op from STOPPED; fails from STARTING and STOPPING.
    pub fn stop(&mut self) -> Result<StopWait, StopError> {
        match self.state {
            ServerState::Stopped => return Ok(StopWait::ready(Ok(()))),
            ServerState::Starting | ServerState::Stopping => {
                return Err(StopError::InvalidState(self.state));
            }
            ServerState::Started => {}
        }

        transition(&mut self.state, ServerState::Stopping)
            .map_err(|e| StopError::InvalidState(e.from))?;
        self.logger.info("server stopping");

        self.accepting = false;
        self.listeners.clear();

        // abort pending handshakes: counters back, FIN out
        let pending: Vec<u64> = self.pending_tls.keys().copied().collect();
        for id in pending {
            if let Some(mut pending) = self.pending_tls.remove(&id) {
                pending.handshake.abort();
                self.admission.lock().release(pending.block);
            }
        }

        // idle connections close now; busy ones get a zeroed budget
        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in ids {
            let idle = self
                .clients
                .get(&id)
                .map(|c| c.in_flight_responses == 0)
                .unwrap_or(false);
            if idle {
                self.close_client(id);
            } else if let Some(client) = self.clients.get_mut(&id) {
                client.remaining_requests = 0;
                client.sink.set_close_when_drained();
            }
        }

        let shared = Arc::new(Mutex::new(StopShared {
            finished: None,
            wakers: Vec::new(),
        }));
        let mut driver = StopDriver {
            barrier_done: None,
            stopping_notify: Some(self.observers.notify(ServerState::Stopping)),
            stopping_done: false,
            final_notify: None,
            deadline: self.ticker.now() + self.options.shutdown_timeout(),
            shared: Arc::clone(&shared),
            wake: WakeFlag::new(),
        };
        if self.clients.is_empty() && self.pending_tls.is_empty() {
            driver.barrier_done = Some(Ok(()));
        }
        self.stop = Some(driver);

        self.drive();
        Ok(StopWait { shared })
    }

    fn maybe_resolve_stop_barrier(&mut self) {
        if let Some(stop) = &mut self.stop {
            if stop.barrier_done.is_none()
                && self.clients.is_empty()
                && self.pending_tls.is_empty()
            {
                stop.barrier_done = Some(Ok(()));
            }
        }
    }

    fn advance_stop(&mut self) {
        let Some(mut stop) = self.stop.take() else {
            return;
        };
        let waker = Waker::from(Arc::clone(&stop.wake));
        let mut cx = Context::from_waker(&waker);

        if let Some(notify) = &mut stop.stopping_notify {
            if let Poll::Ready(outcome) = Pin::new(notify).poll(&mut cx) {
                self.log_observer_failures(ServerState::Stopping, outcome.failures());
                stop.stopping_notify = None;
                stop.stopping_done = true;
            }
        }

        let deadline_passed = self.ticker.now() >= stop.deadline;
        if stop.barrier_done.is_none() && deadline_passed {
            stop.barrier_done = Some(Err(StopError::Timeout));
        }

        if stop.final_notify.is_none()
            && stop.barrier_done.is_some()
            && (stop.stopping_done || deadline_passed)
        {
            let _ = transition(&mut self.state, ServerState::Stopped);
            self.logger.info("server stopped");
            stop.final_notify = Some(self.observers.notify(ServerState::Stopped));
        }

        if let Some(final_notify) = &mut stop.final_notify {
            if let Poll::Ready(outcome) = Pin::new(final_notify).poll(&mut cx) {
                self.log_observer_failures(ServerState::Stopped, outcome.failures());
                let result = stop.barrier_done.unwrap_or(Ok(()));
                let mut shared = stop.shared.lock();
                shared.finished = Some(result);
                for waker in shared.wakers.drain(..) {
                    waker.wake();
                }
                return; // stop driver retires
            }
        }

        // the deadline bounds the whole sequence, notifications included
        if deadline_passed {
            if self.state == ServerState::Stopping {
                let _ = transition(&mut self.state, ServerState::Stopped);
            }
            let mut shared = stop.shared.lock();
            if shared.finished.is_none() {
                shared.finished = Some(Err(StopError::Timeout));
                for waker in shared.wakers.drain(..) {
                    waker.wake();
                }
            }
            return;
        }

        self.stop = Some(stop);
    }

    fn log_observer_failures(
        &self,
        state: ServerState,
        failures: &[(ObserverHandle, ObserverError)],
    ) {
        for (handle, error) in failures {
            self.logger.log(
                LogEntry::new(LogLevel::Warn, "observer failed")
                    .field("state", state)
                    .field("observer", handle.index())
                    .field("error", error)
                    .at(self.ticker.now()),
            );
        }
    }

    // ------------------------------------------------------------------
    // Event surface
    // ------------------------------------------------------------------

    /// True while listeners should be watched for accept readiness.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Read interest for a connection or pending handshake.
    #[must_use]
    pub fn wants_read(&self, id: u64) -> bool {
        if self.pending_tls.contains_key(&id) {
            return true;
        }
        self.clients.get(&id).is_some_and(Client::wants_read)
    }

    /// Write interest: enabled iff the write buffer is non-empty, or a
    /// pending handshake has flight bytes the socket would not take.
    #[must_use]
    pub fn wants_write(&self, id: u64) -> bool {
        if let Some(pending) = self.pending_tls.get(&id) {
            return pending.handshake.wants_write();
        }
        self.clients.get(&id).is_some_and(Client::wants_write)
    }

    /// Ids of live connections and pending handshakes.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.clients.keys().copied().collect();
        ids.extend(self.pending_tls.keys().copied());
        ids.sort_unstable();
        ids
    }

    /// Accept readiness on `endpoint`: accepts until the listener would
    /// block, admitting or denying each connection.
    pub fn handle_accept(&mut self, endpoint: &Endpoint) {
        loop {
            if !self.accepting {
                break;
            }
            let Some(listener) = self.listeners.get_mut(endpoint) else {
                break;
            };
            match listener.accept() {
                Ok(Some((transport, peer))) => {
                    self.admit(endpoint.clone(), transport, peer);
                }
                Ok(None) => break,
                Err(e) => {
                    self.logger.log(
                        LogEntry::new(LogLevel::Warn, "accept failed")
                            .field("listener", endpoint)
                            .field("error", e)
                            .at(self.ticker.now()),
                    );
                    break;
                }
            }
        }
        self.drive();
    }

    fn admit(&mut self, local: Endpoint, mut transport: Box<dyn Transport>, peer: Endpoint) {
        let block = peer.tcp_addr().map(|addr| IpBlock::from_addr(&addr));
        if !self.admission.lock().try_admit(block) {
            // over a cap: no connection state is created at all
            if self.logger.debug_enabled() {
                self.logger.log(
                    LogEntry::new(LogLevel::Debug, "connection denied by admission")
                        .field("peer", &peer)
                        .at(self.ticker.now()),
                );
            }
            transport.shutdown();
            return;
        }

        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let tls = self.contexts.get(&local).and_then(|c| c.tls.clone());
        match tls {
            Some(acceptor) => {
                let handshake = acceptor.begin(transport);
                self.pending_tls.insert(
                    id,
                    PendingTls {
                        handshake,
                        peer,
                        local,
                        block,
                    },
                );
                // drive immediately: the hello may already be readable
                self.drive_handshake(id);
            }
            None => {
                self.import_client(id, transport, peer, local, block, TlsInfo::default());
            }
        }
    }

    fn import_client(
        &mut self,
        id: u64,
        transport: Box<dyn Transport>,
        peer: Endpoint,
        local: Endpoint,
        block: Option<IpBlock>,
        tls: TlsInfo,
    ) {
        let driver = self
            .drivers
            .get(&local)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_driver));
        let parser = driver.parser(&self.options);
        let sink = ConnSink::new(
            self.options.soft_stream_cap(),
            self.options.hard_stream_cap(),
        );

        if self.logger.debug_enabled() {
            self.logger.log(
                LogEntry::new(LogLevel::Debug, "client imported")
                    .conn(id)
                    .field("peer", &peer)
                    .field("driver", driver.name())
                    .at(self.ticker.now()),
            );
        }

        let client = Client {
            id,
            transport,
            peer,
            local,
            block,
            tls,
            read_interest: true,
            read_closed: false,
            write_closed: false,
            in_flight_responses: 0,
            remaining_requests: self.options.max_requests_per_connection(),
            emitters: HashMap::new(),
            driver,
            parser,
            sink,
            drain_action: DrainAction::None,
            exported: false,
        };
        self.clients.insert(id, client);
        self.renew_keepalive(id);
    }

    fn renew_keepalive(&mut self, id: u64) {
        let deadline = self.ticker.now() + self.options.connection_timeout();
        self.keepalive.renew(id, deadline);
    }

    /// Read readiness on a connection or pending handshake.
    pub fn handle_readable(&mut self, id: u64) {
        if self.pending_tls.contains_key(&id) {
            self.drive_handshake(id);
            self.drive();
            return;
        }

        let granularity = self.options.io_granularity();
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.read_closed {
            return;
        }

        let mut buf = vec![0u8; granularity];
        match client.transport.read(&mut buf) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Ok(0) | Err(_) => {
                // EOF (or terminal read error) with nothing buffered
                if client.write_closed || client.in_flight_responses == 0 {
                    self.close_client(id);
                } else {
                    client.read_closed = true;
                    client.read_interest = false;
                    client.fail_emitters(&BodyError::Disconnected);
                }
            }
            Ok(n) => {
                self.renew_keepalive(id);
                let mut events = Vec::new();
                if let Some(client) = self.clients.get_mut(&id) {
                    client.parser.feed(&buf[..n], &mut events);
                }
                self.handle_parser_events(id, events);
            }
        }
        self.drive();
    }

    /// Write readiness on a connection or pending handshake.
    pub fn handle_writable(&mut self, id: u64) {
        if self.pending_tls.contains_key(&id) {
            self.drive_handshake(id);
            self.drive();
            return;
        }

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.write_closed {
            return;
        }

        match client.sink.drain_into(client.transport.as_mut()) {
            Ok(_) => {
                client.sink.release_gate_if_drained();
                let drained = client.sink.is_empty();
                if drained && client.drain_action == DrainAction::Close {
                    self.close_client(id);
                } else {
                    self.flush_completions(id);
                }
            }
            Err(_) => {
                if client.read_closed {
                    self.close_client(id);
                } else {
                    client.write_closed = true;
                    client.sink.mark_write_closed();
                }
            }
        }
        self.drive();
    }

    /// Advances loop time: sweeps keep-alive expiry, enforces the stop
    /// deadline, and drives pending work.
    pub fn tick(&mut self, unix_now: u64) {
        self.ticker.advance_to(unix_now);
        let now = self.ticker.now();

        for id in self.keepalive.expired(now) {
            // a slow response still producing is busy, not idle
            let busy = self.clients.get(&id).map(Client::is_busy).unwrap_or(false);
            if busy {
                continue;
            }
            if self.clients.contains_key(&id) {
                if self.logger.debug_enabled() {
                    self.logger.log(
                        LogEntry::new(LogLevel::Debug, "keep-alive expired")
                            .conn(id)
                            .at(now),
                    );
                }
                self.close_client(id);
            }
        }

        self.drive();
    }

    /// Polls handler tasks and stop progress. Invoked from every event
    /// callback; embedders may call it for external wakes.
    pub fn drive(&mut self) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.tasks.len() {
                let runnable = !self.tasks[i].started || self.tasks[i].wake.take();
                if !runnable {
                    i += 1;
                    continue;
                }
                self.tasks[i].started = true;
                progressed = true;

                let waker = Waker::from(Arc::clone(&self.tasks[i].wake));
                let mut cx = Context::from_waker(&waker);
                match self.tasks[i].future.as_mut().poll(&mut cx) {
                    Poll::Ready(result) => {
                        let task = self.tasks.remove(i);
                        self.resolve_application(task, result);
                    }
                    Poll::Pending => {
                        i += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in ids {
            self.flush_completions(id);
        }

        self.advance_stop();
    }

    // ------------------------------------------------------------------
    // Parser events and dispatch
    // ------------------------------------------------------------------

    fn handle_parser_events(&mut self, id: u64, events: Vec<ParserEvent>) {
        for event in events {
            if !self.clients.contains_key(&id) {
                return;
            }
            self.handle_parser_event(id, event);
        }
    }

    fn handle_parser_event(&mut self, id: u64, event: ParserEvent) {
        match event {
            ParserEvent::HeadersOnly(head) => {
                self.dispatch(id, head, None);
            }
            ParserEvent::EntityHeaders(head) => {
                let (emitter, body) = BodyEmitter::channel(head.content_length);
                if let Some(client) = self.clients.get_mut(&id) {
                    client.emitters.insert(head.stream_id, emitter);
                }
                self.dispatch(id, head, Some(body));
            }
            ParserEvent::EntityPart { stream_id, chunk } => {
                if let Some(client) = self.clients.get(&id) {
                    if let Some(emitter) = client.emitters.get(&stream_id) {
                        emitter.emit(chunk);
                    }
                }
            }
            ParserEvent::EntityComplete { stream_id } => {
                if let Some(client) = self.clients.get(&id) {
                    if let Some(emitter) = client.emitters.get(&stream_id) {
                        emitter.complete();
                    }
                }
            }
            ParserEvent::SizeWarning {
                stream_id,
                received,
                limit,
            } => {
                // fail the emitter, then install a fresh sink so further
                // parts do not land on a terminated channel; whether to
                // close or drain the oversize body is the responder's call
                if let Some(client) = self.clients.get_mut(&id) {
                    if let Some(emitter) = client.emitters.get_mut(&stream_id) {
                        emitter.fail(BodyError::TooLarge { received, limit });
                        *emitter = BodyEmitter::dangling();
                    }
                }
            }
            ParserEvent::ParseError { status, message } => {
                self.handle_parse_error(id, status, message);
            }
        }
    }

    fn handle_parse_error(&mut self, id: u64, status: StatusCode, message: String) {
        self.keepalive.remove(id);
        self.logger.log(
            LogEntry::new(LogLevel::Warn, "parse error")
                .conn(id)
                .field("status", status.as_u16())
                .field("detail", &message)
                .at(self.ticker.now()),
        );

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.read_interest = false;

        let streaming = client.active_emitters() > 0;
        if streaming {
            // a response is mid-stream: let it flush, then close
            client.fail_emitters(&BodyError::Io(message));
            client.sink.set_close_when_drained();
            client.drain_action = DrainAction::Close;
            return;
        }

        let sink = client.sink.clone();
        // the parser failed before a usable version was known
        let writer = client.driver.writer(HttpVersion::Http11, false);
        client.in_flight_responses += 1;
        sink.set_close_when_drained();
        let stream_id = u64::MAX; // no request stream carries this response

        let response = FixedResponse::new(status, default_error_body(status, None))
            .reason(message)
            .header("connection", b"close".to_vec());
        if send_fixed(&sink, writer, &response, self.ticker.http_date(), stream_id).is_err() {
            self.close_client(id);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.drain_action = DrainAction::Close;
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, id: u64, head: RequestHead, body: Option<StreamedBody>) {
        let stopping = self.state == ServerState::Stopping;
        let allow = format_allow_header(self.options.allowed_methods());
        let http_date = self.ticker.http_date().to_string();
        let arrived_at = self.ticker.now();
        let normalize = self.options.normalize_method_case();

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };

        // pre-dispatch bookkeeping
        if client.remaining_requests == 0 {
            // budget exhausted: never begin another response
            client.read_interest = false;
            client.sink.set_close_when_drained();
            return;
        }
        client.remaining_requests -= 1;
        let last_request = client.remaining_requests == 0;
        client.in_flight_responses += 1;

        let sink = client.sink.clone();
        let driver = Arc::clone(&client.driver);
        let local = client.local.clone();
        let remote = client.peer.tcp_addr();
        let version = head.version;
        let stream_id = head.stream_id;

        let mut method_token = head.method.clone();
        if normalize {
            method_token.make_ascii_uppercase();
        }
        let method = Method::from_bytes(&method_token);
        let head_request = method == Some(Method::Head);

        let finish_fixed = |server: &mut Self, response: FixedResponse, close: bool| {
            let writer = driver.writer(version, head_request);
            let response = if close || last_request {
                sink.set_close_when_drained();
                response.header("connection", b"close".to_vec())
            } else {
                response
            };
            if send_fixed(&sink, writer, &response, &http_date, stream_id).is_err() {
                server.close_client(id);
            }
        };

        // 1. shutdown in progress
        if stopping {
            let response = FixedResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                default_error_body(StatusCode::SERVICE_UNAVAILABLE, None),
            );
            finish_fixed(self, response, true);
            return;
        }

        // 2. method whitelist
        let allowed = method.is_some_and(|m| self.options.allowed_methods().contains(&m));
        if !allowed {
            let response = FixedResponse::new(
                StatusCode::METHOD_NOT_ALLOWED,
                default_error_body(StatusCode::METHOD_NOT_ALLOWED, None),
            )
            .header("allow", allow.into_bytes());
            finish_fixed(self, response, false);
            return;
        }
        let method = match method {
            Some(m) => m,
            None => return, // unreachable: allowed implies Some
        };

        let request = Request::new(
            id,
            stream_id,
            method,
            head.uri.clone(),
            version,
            head.headers.clone(),
            remote,
            arrived_at,
            http_date.clone(),
            match body {
                Some(stream) => RequestBody::Streamed(stream),
                None => RequestBody::None,
            },
        );

        // 3. host selection
        let vhost_index = self.host_selector.select(&self.hosts, request.host(), &local);
        let Some(vhost_index) = vhost_index else {
            let response = FixedResponse::new(
                StatusCode::BAD_REQUEST,
                default_error_body(StatusCode::BAD_REQUEST, Some("Invalid Host")),
            )
            .reason("Bad Request: Invalid Host");
            finish_fixed(self, response, true);
            return;
        };

        // 4. TRACE echo
        if method == Method::Trace {
            let response = FixedResponse::new(StatusCode::OK, request.trace_echo())
                .header("content-type", b"message/http".to_vec());
            finish_fixed(self, response, false);
            return;
        }

        // 5. server-wide OPTIONS
        if method == Method::Options && request.uri() == "*" {
            let response =
                FixedResponse::new(StatusCode::OK, Vec::new()).header("allow", allow.into_bytes());
            finish_fixed(self, response, false);
            return;
        }

        // 6. the application
        let vhost = &self.hosts[vhost_index];
        let filter_factories: Vec<Arc<dyn FilterFactory>> = vhost.filters().to_vec();
        let filters = driver.filters(&head, &filter_factories);
        let writer = driver.writer(version, head_request);

        let responder = Responder::new(
            StatusCode::OK,
            version,
            filters,
            writer,
            sink.clone(),
            stream_id,
            driver.supports_push(),
        );
        let _ = responder.set_header("date", http_date.clone().into_bytes());
        if last_request {
            let _ = responder.set_header("connection", b"close".to_vec());
            sink.set_close_when_drained();
        }

        let future = vhost.handler().clone().handle(request, responder.clone());
        self.tasks.push(TaskEntry {
            conn_id: id,
            version,
            future,
            responder,
            filter_factories,
            bad_filter_keys: Vec::new(),
            wake: WakeFlag::new(),
            started: false,
        });
    }

    fn resolve_application(&mut self, mut task: TaskEntry, result: Result<(), AppError>) {
        let id = task.conn_id;
        let Some(client) = self.clients.get(&id) else {
            return; // closed or exported: no further work
        };
        if client.sink.is_write_closed() || client.sink.is_exported() {
            return;
        }
        let sink = client.sink.clone();
        let driver = Arc::clone(&client.driver);
        let debug = self.options.debug();
        let http_date = self.ticker.http_date().to_string();
        let stream_id = task.responder.stream_id();

        match result {
            Ok(()) => match task.responder.state() {
                ResponseState::Ended => {}
                ResponseState::Started => {
                    if task.responder.finish_implicit().is_err() {
                        self.close_client(id);
                    }
                }
                ResponseState::Created => {
                    // success without a response: 404 with the default body
                    let response = FixedResponse::new(
                        StatusCode::NOT_FOUND,
                        default_error_body(StatusCode::NOT_FOUND, None),
                    );
                    let version = task.version;
                    let make_writer = || driver.writer(version, false);
                    if send_with_recovery(
                        &sink,
                        &make_writer,
                        &task.filter_factories,
                        &mut task.bad_filter_keys,
                        &response,
                        &http_date,
                        stream_id,
                    )
                    .is_err()
                    {
                        self.close_client(id);
                    }
                }
            },
            Err(AppError::Disconnect) => {
                // the application is not required to catch disconnects
                if self.logger.debug_enabled() {
                    self.logger.log(
                        LogEntry::new(LogLevel::Debug, "handler observed disconnect")
                            .conn(id)
                            .at(self.ticker.now()),
                    );
                }
            }
            Err(AppError::Failure(message)) => {
                self.logger.log(
                    LogEntry::new(LogLevel::Error, "application error")
                        .conn(id)
                        .field("error", &message)
                        .at(self.ticker.now()),
                );

                if task.responder.state() != ResponseState::Created {
                    // mid-stream failure cannot be recovered
                    self.close_client(id);
                    return;
                }

                if let Some(key) = task.responder.failed_filter() {
                    if !task.bad_filter_keys.contains(&key) {
                        task.bad_filter_keys.push(key);
                    }
                }

                let detail = if debug { Some(message.as_str()) } else { None };
                let response = FixedResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    default_error_body(StatusCode::INTERNAL_SERVER_ERROR, detail),
                );
                let version = task.version;
                let make_writer = || driver.writer(version, false);
                if send_with_recovery(
                    &sink,
                    &make_writer,
                    &task.filter_factories,
                    &mut task.bad_filter_keys,
                    &response,
                    &http_date,
                    stream_id,
                )
                .is_err()
                {
                    self.close_client(id);
                }
            }
        }
    }

    fn flush_completions(&mut self, id: u64) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let completions = client.sink.take_completions_if_drained();
        if completions.is_empty() {
            return;
        }
        for stream_id in completions {
            client.in_flight_responses = client.in_flight_responses.saturating_sub(1);
            client.emitters.remove(&stream_id);
        }
        let close = client.sink.close_when_drained()
            || (client.in_flight_responses == 0 && client.read_closed);
        if close {
            self.close_client(id);
        } else {
            self.renew_keepalive(id);
        }
    }

    // ------------------------------------------------------------------
    // TLS, close, export
    // ------------------------------------------------------------------

    fn drive_handshake(&mut self, id: u64) {
        let Some(pending) = self.pending_tls.get_mut(&id) else {
            return;
        };
        match pending.handshake.drive() {
            HandshakeStatus::InProgress => {}
            HandshakeStatus::Ready => {
                if let Some(pending) = self.pending_tls.remove(&id) {
                    let PendingTls {
                        handshake,
                        peer,
                        local,
                        block,
                    } = pending;
                    let (info, transport) = handshake.into_transport();
                    self.import_client(id, transport, peer, local, block, info);
                }
            }
            HandshakeStatus::Failed(reason) => {
                self.logger.log(
                    LogEntry::new(LogLevel::Warn, "tls handshake failed")
                        .conn(id)
                        .field("error", &reason)
                        .at(self.ticker.now()),
                );
                if let Some(mut pending) = self.pending_tls.remove(&id) {
                    pending.handshake.abort();
                    self.admission.lock().release(pending.block);
                }
                self.maybe_resolve_stop_barrier();
            }
        }
    }

    /// Closes a connection: removes it from the table, clears its timer,
    /// FINs the socket, restores admission slots, and fails body emitters
    /// and suspended producers. Terminal and idempotent.
    pub fn close_client(&mut self, id: u64) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        self.keepalive.remove(id);
        client.read_closed = true;
        client.write_closed = true;
        client.transport.shutdown();
        client.sink.mark_write_closed();
        client.fail_emitters(&BodyError::Disconnected);
        if !client.exported {
            self.admission.lock().release(client.block);
        }
        // abandoned handler futures are dropped with their tasks
        self.tasks.retain(|t| t.conn_id != id);

        if self.logger.debug_enabled() {
            self.logger.log(
                LogEntry::new(LogLevel::Debug, "client closed")
                    .conn(id)
                    .at(self.ticker.now()),
            );
        }

        self.maybe_resolve_stop_barrier();
    }

    /// Hands a live socket to a protocol upgrader.
    ///
    /// The connection leaves all server bookkeeping without the socket
    /// being closed; the returned disposer restores admission slots when
    /// the upgrader is done.
    ///
    /// # Errors
    ///
    /// [`ExportError::UnknownConnection`] when the id is not live.
    pub fn export(&mut self, id: u64) -> Result<Exported, ExportError> {
        let Some(mut client) = self.clients.remove(&id) else {
            return Err(ExportError::UnknownConnection(id));
        };
        self.keepalive.remove(id);
        client.exported = true;
        client.sink.mark_exported();
        self.tasks.retain(|t| t.conn_id != id);

        self.logger.log(
            LogEntry::new(LogLevel::Info, "connection exported")
                .conn(id)
                .at(self.ticker.now()),
        );

        let disposer = ExportDisposer {
            admission: Arc::clone(&self.admission),
            block: client.block,
            released: false,
        };
        self.maybe_resolve_stop_barrier();

        Ok(Exported {
            transport: client.transport,
            peer: client.peer,
            tls: client.tls,
            disposer,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("clients", &self.clients.len())
            .field("pending_tls", &self.pending_tls.len())
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

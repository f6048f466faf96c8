//! Per-connection state: the client record, the shared write sink, and the
//! backpressure gate.
//!
//! The server's connection table owns a [`Client`] per live connection.
//! Response producers (handler tasks) reach the connection only through
//! the cloneable [`ConnSink`]; the loop drains the sink from the writable
//! path. The write watcher invariant holds by construction: the loop
//! queries [`Client::wants_write`], which is true iff the sink holds
//! bytes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use hearth_core::request::BodyError;
use parking_lot::Mutex;

use crate::admission::IpBlock;
use crate::body::BodyEmitter;
use crate::driver::{HttpDriver, RequestParser};
use crate::listener::Endpoint;
use crate::tls::TlsInfo;
use crate::transport::Transport;

/// Action armed to run when the write buffer fully drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainAction {
    /// Nothing special.
    #[default]
    None,
    /// Close the connection once everything buffered has flushed.
    Close,
}

struct GateState {
    result: Option<Result<(), BodyError>>,
    waker: Option<Waker>,
}

/// Pending completion a suspended response producer awaits.
///
/// Resolves `Ok` when the write buffer drains back under the soft cap,
/// `Err(Disconnected)` when the connection dies first.
pub struct WriteGate {
    state: Arc<Mutex<GateState>>,
}

impl Future for WriteGate {
    type Output = Result<(), BodyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

struct SinkState {
    buf: Vec<u8>,
    soft_cap: usize,
    hard_cap: usize,
    write_closed: bool,
    exported: bool,
    close_when_drained: bool,
    completions: Vec<u64>,
    gate: Option<Arc<Mutex<GateState>>>,
}

/// Cloneable handle to a connection's write buffer.
///
/// Producers push serialized response bytes; the loop's writable path
/// drains them with backpressure.
#[derive(Clone)]
pub struct ConnSink {
    state: Arc<Mutex<SinkState>>,
}

/// Push failed because the connection can no longer take bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl ConnSink {
    /// Creates a sink with the given backpressure caps.
    #[must_use]
    pub fn new(soft_cap: usize, hard_cap: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                buf: Vec::new(),
                soft_cap,
                hard_cap,
                write_closed: false,
                exported: false,
                close_when_drained: false,
                completions: Vec::new(),
                gate: None,
            })),
        }
    }

    /// Appends response bytes.
    ///
    /// # Errors
    ///
    /// Fails once the write side closed or the connection was exported.
    pub fn push(&self, bytes: &[u8]) -> Result<(), SinkClosed> {
        let mut state = self.state.lock();
        if state.write_closed || state.exported {
            return Err(SinkClosed);
        }
        debug_assert!(
            state.buf.len() + bytes.len() <= state.hard_cap.max(state.buf.len()),
            "write past hard cap is a driver bug"
        );
        state.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.lock().buf.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().buf.is_empty()
    }

    /// True when the buffer exceeds the soft cap and the producer should
    /// suspend on [`arm_gate`](Self::arm_gate).
    #[must_use]
    pub fn over_soft_cap(&self) -> bool {
        let state = self.state.lock();
        state.buf.len() > state.soft_cap
    }

    /// Arms (or reuses) the drain-notification gate.
    #[must_use]
    pub fn arm_gate(&self) -> WriteGate {
        let mut state = self.state.lock();
        if state.write_closed {
            // resolve immediately; the connection is gone
            return WriteGate {
                state: Arc::new(Mutex::new(GateState {
                    result: Some(Err(BodyError::Disconnected)),
                    waker: None,
                })),
            };
        }
        let gate = state
            .gate
            .get_or_insert_with(|| {
                Arc::new(Mutex::new(GateState {
                    result: None,
                    waker: None,
                }))
            })
            .clone();
        WriteGate { state: gate }
    }

    /// Resolves an outstanding gate once the buffer is back at or under
    /// the soft cap. Called from the writable path after progress.
    pub fn release_gate_if_drained(&self) {
        let mut state = self.state.lock();
        if state.buf.len() <= state.soft_cap {
            if let Some(gate) = state.gate.take() {
                let mut gate = gate.lock();
                gate.result = Some(Ok(()));
                if let Some(waker) = gate.waker.take() {
                    waker.wake();
                }
            }
        }
    }

    /// Fails any suspended producer and refuses further pushes.
    pub fn mark_write_closed(&self) {
        let mut state = self.state.lock();
        state.write_closed = true;
        if let Some(gate) = state.gate.take() {
            let mut gate = gate.lock();
            gate.result = Some(Err(BodyError::Disconnected));
            if let Some(waker) = gate.waker.take() {
                waker.wake();
            }
        }
    }

    /// True once [`mark_write_closed`](Self::mark_write_closed) ran.
    #[must_use]
    pub fn is_write_closed(&self) -> bool {
        self.state.lock().write_closed
    }

    /// Marks the connection exported: dead for HTTP, socket unowned.
    pub fn mark_exported(&self) {
        self.state.lock().exported = true;
    }

    /// True once exported.
    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.state.lock().exported
    }

    /// Requests a close once the buffer fully drains.
    pub fn set_close_when_drained(&self) {
        self.state.lock().close_when_drained = true;
    }

    /// True when a drained buffer should close the connection.
    #[must_use]
    pub fn close_when_drained(&self) -> bool {
        self.state.lock().close_when_drained
    }

    /// Records that the response on `stream_id` ended; the completion is
    /// consumed once its bytes have drained.
    pub fn register_completion(&self, stream_id: u64) {
        self.state.lock().completions.push(stream_id);
    }

    /// Takes the pending completions if the buffer is fully drained.
    #[must_use]
    pub fn take_completions_if_drained(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        if state.buf.is_empty() {
            std::mem::take(&mut state.completions)
        } else {
            Vec::new()
        }
    }

    /// Writes as much of the buffer as `transport` takes, removing the
    /// written prefix. Returns bytes written.
    ///
    /// # Errors
    ///
    /// Propagates transport errors other than `WouldBlock` (which returns
    /// `Ok(0)` with bytes retained).
    pub fn drain_into(&self, transport: &mut dyn Transport) -> std::io::Result<usize> {
        let mut state = self.state.lock();
        if state.buf.is_empty() {
            return Ok(0);
        }
        match transport.write(&state.buf) {
            // zero bytes accepted with data pending: the peer closed
            Ok(0) => Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                state.buf.drain(..n);
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Per-connection record owned by the server's connection table.
pub struct Client {
    /// Stable connection id.
    pub id: u64,
    /// The byte stream. Present until close or export.
    pub transport: Box<dyn Transport>,
    /// Peer endpoint.
    pub peer: Endpoint,
    /// Local (listener) endpoint.
    pub local: Endpoint,
    /// Peer's admission block; `None` for unix peers.
    pub block: Option<IpBlock>,
    /// Negotiated TLS parameters; empty when plaintext.
    pub tls: TlsInfo,
    /// Read watcher interest.
    pub read_interest: bool,
    /// Read half-close flag.
    pub read_closed: bool,
    /// Write half-close flag.
    pub write_closed: bool,
    /// Responses started and not yet fully drained.
    pub in_flight_responses: usize,
    /// Keep-alive budget: requests this connection may still begin.
    pub remaining_requests: u32,
    /// Active body emitters keyed by stream id.
    pub emitters: HashMap<u64, BodyEmitter>,
    /// The bound driver.
    pub driver: Arc<dyn HttpDriver>,
    /// The driver's resumable parser. Dropped with the client.
    pub parser: Box<dyn RequestParser>,
    /// Shared write sink.
    pub sink: ConnSink,
    /// Armed drain action.
    pub drain_action: DrainAction,
    /// Set when the socket was handed to a protocol upgrader.
    pub exported: bool,
}

impl Client {
    /// Write watcher interest: enabled iff the buffer is non-empty.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.write_closed && !self.sink.is_empty()
    }

    /// Read watcher interest.
    #[must_use]
    pub fn wants_read(&self) -> bool {
        self.read_interest && !self.read_closed
    }

    /// Emitters that have not terminated: streams still owed entity data.
    #[must_use]
    pub fn active_emitters(&self) -> usize {
        self.emitters.values().filter(|e| !e.is_terminated()).count()
    }

    /// True when a slow response is still being produced, so keep-alive
    /// expiry must spare the connection.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight_responses > self.active_emitters()
    }

    /// Fails every active emitter with `error` and installs fresh sinks so
    /// late parser callbacks land harmlessly.
    pub fn fail_emitters(&mut self, error: &BodyError) {
        for emitter in self.emitters.values_mut() {
            if !emitter.is_terminated() {
                emitter.fail(error.clone());
            }
            *emitter = BodyEmitter::dangling();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    impl Transport for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::WouldBlock.into())
        }

        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn shutdown(&mut self) {}
    }

    fn noop_waker() -> Waker {
        struct Noop;
        impl std::task::Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }
        Waker::from(Arc::new(Noop))
    }

    #[test]
    fn push_then_drain_round_trip() {
        let sink = ConnSink::new(16, 64);
        sink.push(b"hello").unwrap();
        assert_eq!(sink.buffered(), 5);

        let mut transport = NullTransport;
        assert_eq!(sink.drain_into(&mut transport).unwrap(), 5);
        assert!(sink.is_empty());
    }

    #[test]
    fn gate_resolves_on_drain() {
        let sink = ConnSink::new(4, 64);
        sink.push(b"0123456789").unwrap();
        assert!(sink.over_soft_cap());

        let mut gate = Box::pin(sink.arm_gate());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(gate.as_mut().poll(&mut cx), Poll::Pending));

        // drain below the soft cap, gate opens
        let mut transport = NullTransport;
        sink.drain_into(&mut transport).unwrap();
        sink.release_gate_if_drained();
        assert!(matches!(gate.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn write_close_fails_gate_and_pushes() {
        let sink = ConnSink::new(4, 64);
        sink.push(b"0123456789").unwrap();

        let mut gate = Box::pin(sink.arm_gate());
        sink.mark_write_closed();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(
            gate.as_mut().poll(&mut cx),
            Poll::Ready(Err(BodyError::Disconnected))
        ));
        assert_eq!(sink.push(b"more"), Err(SinkClosed));
    }

    #[test]
    fn completions_wait_for_drain() {
        let sink = ConnSink::new(16, 64);
        sink.push(b"body").unwrap();
        sink.register_completion(0);

        assert!(sink.take_completions_if_drained().is_empty());

        let mut transport = NullTransport;
        sink.drain_into(&mut transport).unwrap();
        assert_eq!(sink.take_completions_if_drained(), vec![0]);
        assert!(sink.take_completions_if_drained().is_empty());
    }
}

//! Server lifecycle state machine and observers.
//!
//! The state machine is the four-state loop
//! `STOPPED → STARTING → STARTED → STOPPING → STOPPED`. Observers subscribe
//! to transitions and are notified concurrently; one observer's failure
//! never hides another's, and whether a failure is fatal depends on the
//! phase (startup notifications are fatal, stop notifications are logged).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;

/// Boxed future alias used across the lifecycle surface.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Future returned by [`Observer::update`].
pub type ObserverFuture = BoxFuture<Result<(), ObserverError>>;

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServerState {
    /// Not running; the only state `start` accepts.
    Stopped,
    /// Binding sockets and notifying observers.
    Starting,
    /// Accepting and serving connections.
    Started,
    /// Draining in-flight work.
    Stopping,
}

impl ServerState {
    /// Uppercase state name, as used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
        }
    }

    /// Whether the `self → to` transition is allowed.
    #[must_use]
    pub const fn can_transition(self, to: ServerState) -> bool {
        matches!(
            (self, to),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Started, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    /// State the server was in.
    pub from: ServerState,
    /// State that was requested.
    pub to: ServerState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Validated state transition.
///
/// # Errors
///
/// Returns [`TransitionError`] when the transition is not in the allowed
/// cycle.
pub fn transition(state: &mut ServerState, to: ServerState) -> Result<(), TransitionError> {
    if state.can_transition(to) {
        *state = to;
        Ok(())
    } else {
        Err(TransitionError { from: *state, to })
    }
}

/// Error reported by an observer's update future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverError {
    message: String,
}

impl ObserverError {
    /// Creates an observer error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ObserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ObserverError {}

/// A component notified of lifecycle transitions.
///
/// Observers see the state *after* the server recorded it.
pub trait Observer: Send + Sync {
    /// React to a transition. Runs concurrently with other observers.
    fn update(&self, state: ServerState) -> ObserverFuture;
}

/// Opaque handle identifying an attached observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(usize);

impl ObserverHandle {
    /// Arena index, for logging.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Arena-backed observer registry.
///
/// Handles stay valid until detached; freed slots are reused.
#[derive(Default)]
pub struct ObserverSet {
    slots: Vec<Option<Arc<dyn Observer>>>,
}

impl ObserverSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an observer, returning its handle.
    pub fn attach(&mut self, observer: Arc<dyn Observer>) -> ObserverHandle {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(observer);
                return ObserverHandle(i);
            }
        }
        self.slots.push(Some(observer));
        ObserverHandle(self.slots.len() - 1)
    }

    /// Detaches an observer. Returns false if the handle was stale.
    pub fn detach(&mut self, handle: ObserverHandle) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Number of attached observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no observers are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fans a transition out to every observer.
    ///
    /// All update futures run concurrently; the returned future resolves
    /// when the last one finishes, carrying every failure alongside its
    /// handle. One observer failing does not cancel the rest.
    #[must_use]
    pub fn notify(&self, state: ServerState) -> NotifyAll {
        let pending = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .map(|observer| Some((ObserverHandle(i), observer.update(state))))
            })
            .collect();
        NotifyAll {
            pending,
            failures: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("attached", &self.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Join of all observer update futures with failure isolation.
pub struct NotifyAll {
    pending: Vec<Option<(ObserverHandle, ObserverFuture)>>,
    failures: Vec<(ObserverHandle, ObserverError)>,
}

/// Aggregate result of an observer fan-out.
#[derive(Debug)]
pub struct NotifyOutcome {
    failures: Vec<(ObserverHandle, ObserverError)>,
}

impl NotifyOutcome {
    /// True when every observer succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// The collected failures.
    #[must_use]
    pub fn failures(&self) -> &[(ObserverHandle, ObserverError)] {
        &self.failures
    }

    /// Consumes the outcome, yielding the failures.
    #[must_use]
    pub fn into_failures(self) -> Vec<(ObserverHandle, ObserverError)> {
        self.failures
    }
}

impl Future for NotifyAll {
    type Output = NotifyOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;

        for slot in &mut this.pending {
            let Some((handle, future)) = slot.as_mut() else {
                continue;
            };
            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(())) => {
                    *slot = None;
                }
                Poll::Ready(Err(e)) => {
                    this.failures.push((*handle, e));
                    *slot = None;
                }
                Poll::Pending => {
                    all_done = false;
                }
            }
        }

        if all_done {
            Poll::Ready(NotifyOutcome {
                failures: std::mem::take(&mut this.failures),
            })
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        seen: parking_lot::Mutex<Vec<ServerState>>,
        fail_on: Option<ServerState>,
    }

    impl Recording {
        fn new(fail_on: Option<ServerState>) -> Arc<Self> {
            Arc::new(Self {
                seen: parking_lot::Mutex::new(Vec::new()),
                fail_on,
            })
        }
    }

    impl Observer for Recording {
        fn update(&self, state: ServerState) -> ObserverFuture {
            self.seen.lock().push(state);
            let fail = self.fail_on == Some(state);
            Box::pin(async move {
                if fail {
                    Err(ObserverError::new("refused"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("runtime must build");
        rt.block_on(future)
    }

    #[test]
    fn transition_cycle_is_allowed() {
        let mut state = ServerState::Stopped;
        transition(&mut state, ServerState::Starting).unwrap();
        transition(&mut state, ServerState::Started).unwrap();
        transition(&mut state, ServerState::Stopping).unwrap();
        transition(&mut state, ServerState::Stopped).unwrap();
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut state = ServerState::Stopped;
        let err = transition(&mut state, ServerState::Started).unwrap_err();
        assert_eq!(err.from, ServerState::Stopped);
        assert_eq!(err.to, ServerState::Started);
        assert_eq!(state, ServerState::Stopped);
    }

    #[test]
    fn attach_detach_reuses_slots() {
        let mut set = ObserverSet::new();
        let a = set.attach(Recording::new(None));
        let b = set.attach(Recording::new(None));
        assert_eq!(set.len(), 2);

        assert!(set.detach(a));
        assert!(!set.detach(a));
        assert_eq!(set.len(), 1);

        let c = set.attach(Recording::new(None));
        assert_eq!(c.index(), a.index());
        assert_ne!(c.index(), b.index());
    }

    #[test]
    fn notify_reaches_all_observers() {
        let mut set = ObserverSet::new();
        let first = Recording::new(None);
        let second = Recording::new(None);
        set.attach(first.clone());
        set.attach(second.clone());

        let outcome = block_on(set.notify(ServerState::Starting));
        assert!(outcome.is_ok());
        assert_eq!(*first.seen.lock(), vec![ServerState::Starting]);
        assert_eq!(*second.seen.lock(), vec![ServerState::Starting]);
    }

    #[test]
    fn one_failure_does_not_hide_others() {
        let mut set = ObserverSet::new();
        let ok = Recording::new(None);
        let bad = Recording::new(Some(ServerState::Starting));
        set.attach(ok.clone());
        let bad_handle = set.attach(bad);

        let outcome = block_on(set.notify(ServerState::Starting));
        assert!(!outcome.is_ok());
        assert_eq!(outcome.failures().len(), 1);
        assert_eq!(outcome.failures()[0].0, bad_handle);
        // the healthy observer still ran
        assert_eq!(*ok.seen.lock(), vec![ServerState::Starting]);
    }
}

//! Entity body channel between the parser and the application.
//!
//! The parser side holds a [`BodyEmitter`]; the application side reads a
//! [`StreamedBody`]. Terminations are tagged: completion, a size error, or
//! a client disconnect. A failed emitter is replaced with a fresh sink at
//! the connection so late parser callbacks land harmlessly.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use hearth_core::request::{BodyError, StreamedBody};
use parking_lot::Mutex;

struct ChannelState {
    chunks: VecDeque<Vec<u8>>,
    terminated: Option<Result<(), BodyError>>,
    error_delivered: bool,
    received: usize,
    waker: Option<Waker>,
}

impl ChannelState {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Producer half of the body channel. Owned by the connection, fed by
/// parser events.
pub struct BodyEmitter {
    state: Arc<Mutex<ChannelState>>,
}

impl std::fmt::Debug for BodyEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BodyEmitter")
            .field("received", &state.received)
            .field("terminated", &state.terminated.is_some())
            .finish()
    }
}

impl BodyEmitter {
    /// Creates a connected emitter/body pair.
    #[must_use]
    pub fn channel(expected_size: Option<usize>) -> (Self, StreamedBody) {
        let state = Arc::new(Mutex::new(ChannelState {
            chunks: VecDeque::new(),
            terminated: None,
            error_delivered: false,
            received: 0,
            waker: None,
        }));
        let emitter = Self {
            state: Arc::clone(&state),
        };
        let chunks = BodyChunks { state };
        let body = match expected_size {
            Some(size) => StreamedBody::with_expected_size(chunks, size),
            None => StreamedBody::new(chunks),
        };
        (emitter, body)
    }

    /// A fresh sink with no consumer, installed after an emitter failed so
    /// further parser callbacks have somewhere to go.
    #[must_use]
    pub fn dangling() -> Self {
        Self::channel(None).0
    }

    /// Delivers a body chunk. Ignored once terminated.
    pub fn emit(&self, chunk: Vec<u8>) {
        let mut state = self.state.lock();
        if state.terminated.is_some() {
            return;
        }
        state.received += chunk.len();
        state.chunks.push_back(chunk);
        state.wake();
    }

    /// Terminates the stream successfully. Idempotent.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.terminated.is_none() {
            state.terminated = Some(Ok(()));
            state.wake();
        }
    }

    /// Terminates the stream with a tagged error. Idempotent; the first
    /// termination wins.
    pub fn fail(&self, error: BodyError) {
        let mut state = self.state.lock();
        if state.terminated.is_none() {
            state.terminated = Some(Err(error));
            state.wake();
        }
    }

    /// True once the stream terminated (either way).
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated.is_some()
    }

    /// Bytes emitted so far.
    #[must_use]
    pub fn received(&self) -> usize {
        self.state.lock().received
    }
}

/// Consumer half; wrapped into [`StreamedBody`] by [`BodyEmitter::channel`].
struct BodyChunks {
    state: Arc<Mutex<ChannelState>>,
}

impl asupersync::stream::Stream for BodyChunks {
    type Item = Result<Vec<u8>, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.state.lock();

        if let Some(chunk) = state.chunks.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }

        match &state.terminated {
            Some(Ok(())) => Poll::Ready(None),
            Some(Err(e)) => {
                if state.error_delivered {
                    Poll::Ready(None)
                } else {
                    let e = e.clone();
                    state.error_delivered = true;
                    Poll::Ready(Some(Err(e)))
                }
            }
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::stream::StreamExt;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        let rt = asupersync::runtime::RuntimeBuilder::current_thread()
            .build()
            .expect("runtime must build");
        rt.block_on(future)
    }

    #[test]
    fn chunks_arrive_in_order() {
        let (emitter, body) = BodyEmitter::channel(Some(8));
        emitter.emit(b"hell".to_vec());
        emitter.emit(b"o!".to_vec());
        emitter.complete();

        let collected = block_on(body.collect()).unwrap();
        assert_eq!(collected, b"hello!");
        assert_eq!(emitter.received(), 6);
    }

    #[test]
    fn failure_is_tagged_and_delivered_once() {
        let (emitter, mut body) = BodyEmitter::channel(None);
        emitter.emit(b"partial".to_vec());
        emitter.fail(BodyError::Disconnected);

        block_on(async {
            assert_eq!(body.next().await, Some(Ok(b"partial".to_vec())));
            assert_eq!(body.next().await, Some(Err(BodyError::Disconnected)));
            assert_eq!(body.next().await, None);
        });
    }

    #[test]
    fn first_termination_wins() {
        let (emitter, mut body) = BodyEmitter::channel(None);
        emitter.fail(BodyError::TooLarge {
            received: 10,
            limit: 5,
        });
        emitter.complete();
        emitter.fail(BodyError::Disconnected);

        block_on(async {
            assert_eq!(
                body.next().await,
                Some(Err(BodyError::TooLarge {
                    received: 10,
                    limit: 5
                }))
            );
        });
    }

    #[test]
    fn emit_after_termination_is_dropped() {
        let (emitter, mut body) = BodyEmitter::channel(None);
        emitter.complete();
        emitter.emit(b"late".to_vec());

        assert!(emitter.is_terminated());
        block_on(async {
            assert_eq!(body.next().await, None);
        });
    }

    #[test]
    fn dangling_sink_swallows_traffic() {
        let emitter = BodyEmitter::dangling();
        emitter.emit(b"noise".to_vec());
        emitter.complete();
        assert!(emitter.is_terminated());
    }
}

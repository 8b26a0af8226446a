//! Completion tokens.
//!
//! Every pipeline operation hands exactly one [`Completer`] down the chain
//! and returns the matching [`CompletionHandle`] to the caller. Whichever
//! stage ends the operation resolves the completer; resolving consumes it,
//! so a second resolution cannot be expressed. A completer that is dropped
//! without being resolved fails its handle with
//! [`PipelineError::Abandoned`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::debug;

use crate::error::PipelineError;

/// Result of a pipeline operation.
pub type Outcome = Result<(), PipelineError>;

enum Sink {
    Channel(oneshot::Sender<Outcome>),
    Joined(Arc<Join>),
    Detached(&'static str),
}

impl Sink {
    fn deliver(self, outcome: Outcome) {
        match self {
            Self::Channel(tx) => {
                // The caller may have dropped its handle.
                let _ = tx.send(outcome);
            }
            Self::Joined(join) => join.child_resolved(outcome),
            Self::Detached(label) => {
                if let Err(err) = outcome {
                    debug!(operation = label, "detached operation failed: {err}");
                }
            }
        }
    }
}

struct State {
    sink: Mutex<Option<Sink>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl State {
    fn new(sink: Sink) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(Some(sink)),
            permit: Mutex::new(None),
        })
    }

    fn resolve(&self, outcome: Outcome) {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sink) = sink {
            // Return the in-flight permit before anyone observes the outcome.
            drop(
                self.permit
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            sink.deliver(outcome);
        }
    }

    fn is_resolved(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.resolve(Err(PipelineError::Abandoned));
    }
}

/// Aggregates the completers created by [`Completer::fan_out`].
struct Join {
    remaining: AtomicUsize,
    parent: Mutex<Option<Completer>>,
}

impl Join {
    fn take_parent(&self) -> Option<Completer> {
        self.parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn child_resolved(&self, outcome: Outcome) {
        match outcome {
            Ok(()) => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(parent) = self.take_parent() {
                        parent.complete();
                    }
                }
            }
            // First failure wins; later children find the parent gone.
            Err(err) => {
                if let Some(parent) = self.take_parent() {
                    parent.fail(err);
                }
            }
        }
    }
}

/// Owned token resolving one pipeline operation.
#[must_use = "a dropped completer fails its operation as abandoned"]
pub struct Completer {
    state: Arc<State>,
}

impl Completer {
    /// Create a completer and the handle it resolves.
    pub fn new() -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                state: State::new(Sink::Channel(tx)),
            },
            CompletionHandle { rx },
        )
    }

    /// Completer nobody waits on; failures are logged under `label`.
    pub fn detached(label: &'static str) -> Self {
        Self {
            state: State::new(Sink::Detached(label)),
        }
    }

    /// Resolve successfully.
    pub fn complete(self) {
        self.state.resolve(Ok(()));
    }

    /// Resolve with an error.
    pub fn fail(self, err: impl Into<PipelineError>) {
        self.state.resolve(Err(err.into()));
    }

    /// Resolve with a ready outcome.
    pub fn resolve(self, outcome: Outcome) {
        self.state.resolve(outcome);
    }

    /// Whether the operation already has an outcome.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state.is_resolved()
    }

    /// Split into `count` completers. This one resolves successfully once all
    /// of them did, or with the first failure among them.
    pub fn fan_out(self, count: usize) -> Vec<Completer> {
        if count == 0 {
            self.complete();
            return Vec::new();
        }
        let join = Arc::new(Join {
            remaining: AtomicUsize::new(count),
            parent: Mutex::new(Some(self)),
        });
        (0..count)
            .map(|_| Self {
                state: State::new(Sink::Joined(join.clone())),
            })
            .collect()
    }

    pub(crate) fn attach_permit(&self, permit: OwnedSemaphorePermit) {
        *self
            .state
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(permit);
    }

    /// Second reference used by the pipeline to fail an operation whose
    /// handler returned an error without resolving it.
    pub(crate) fn guard(&self) -> CompletionGuard {
        CompletionGuard {
            state: self.state.clone(),
        }
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

pub(crate) struct CompletionGuard {
    state: Arc<State>,
}

impl CompletionGuard {
    pub(crate) fn fail(self, err: impl Into<PipelineError>) {
        self.state.resolve(Err(err.into()));
    }
}

/// Awaitable outcome of a pipeline operation.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl CompletionHandle {
    /// Outcome if it is already known, without waiting.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PipelineError::Abandoned)),
        }
    }
}

impl Future for CompletionHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PipelineError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandlerError, PolicyViolation};

    #[tokio::test]
    async fn test_complete_resolves_handle() {
        let (done, handle) = Completer::new();
        done.complete();
        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_completer_is_abandoned() {
        let (done, handle) = Completer::new();
        drop(done);
        assert_eq!(handle.await, Err(PipelineError::Abandoned));
    }

    #[tokio::test]
    async fn test_guard_failure_wins_over_later_drop() {
        let (done, handle) = Completer::new();
        let guard = done.guard();
        guard.fail(PolicyViolation::RateLimited);
        assert!(done.is_resolved());
        done.complete();
        assert_eq!(
            handle.await,
            Err(PipelineError::Handler(HandlerError::Policy(
                PolicyViolation::RateLimited
            )))
        );
    }

    #[tokio::test]
    async fn test_fan_out_waits_for_all() {
        let (done, mut handle) = Completer::new();
        let mut parts = done.fan_out(3);
        parts.pop().unwrap().complete();
        parts.pop().unwrap().complete();
        assert!(handle.try_outcome().is_none());
        parts.pop().unwrap().complete();
        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test]
    async fn test_fan_out_first_failure_wins() {
        let (done, handle) = Completer::new();
        let mut parts = done.fan_out(2).into_iter();
        let first = parts.next().unwrap();
        let second = parts.next().unwrap();
        second.fail(PipelineError::Unroutable);
        first.complete();
        assert_eq!(handle.await, Err(PipelineError::Unroutable));
    }

    #[tokio::test]
    async fn test_fan_out_of_zero_completes() {
        let (done, handle) = Completer::new();
        assert!(done.fan_out(0).is_empty());
        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test]
    async fn test_permit_released_on_resolution() {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let (done, _handle) = Completer::new();
        done.attach_permit(semaphore.clone().try_acquire_owned().unwrap());
        assert_eq!(semaphore.available_permits(), 0);
        done.fail(PipelineError::Unroutable);
        assert_eq!(semaphore.available_permits(), 1);
    }
}

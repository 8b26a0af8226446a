//! Executor handles shared by pipeline stages.

use std::future::Future;

use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;

/// The two runtimes stages may schedule work on.
///
/// Every handler callback runs on the dependent runtime. The independent
/// one only waits: on sockets and on timers, like the discovery heartbeat
/// and the chunk sweeper, and hands what it got back to the dependent
/// runtime before any stage sees it.
#[derive(Clone, Debug)]
pub struct Executors {
    dependent: Handle,
    independent: Handle,
}

impl Executors {
    /// Use two distinct runtimes.
    #[must_use]
    pub fn new(dependent: Handle, independent: Handle) -> Self {
        Self {
            dependent,
            independent,
        }
    }

    /// Use the current runtime for both roles.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn current() -> Result<Self, TryCurrentError> {
        let handle = Handle::try_current()?;
        Ok(Self::new(handle.clone(), handle))
    }

    /// Runtime for short pipeline work.
    #[must_use]
    pub fn dependent(&self) -> &Handle {
        &self.dependent
    }

    /// Runtime for timers and isolated work.
    #[must_use]
    pub fn independent(&self) -> &Handle {
        &self.independent
    }

    /// Spawn on the dependent runtime.
    pub fn spawn_dependent<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.dependent.spawn(future)
    }

    /// Spawn on the independent runtime.
    pub fn spawn_independent<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.independent.spawn(future)
    }
}

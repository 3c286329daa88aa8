//! Futures returned by `submit`
//!
//! One handle abstraction across all execution modes. A future is pending
//! until its outcome lands, then done forever; the outcome is an explicit
//! tagged `Result`, so "no value" and "an error occurred" can never be
//! confused by truthiness.
//!
//! Waiting is a real blocking wait on a condition variable (or, for the
//! remote variant, a blocking round trip), never a spin loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use mooring_api::{Payload, TaskError, TaskId, TaskOutcome};

/// Failure modes of waiting on a future
///
/// A timeout is distinct from a task failure: the underlying task keeps
/// running and a later wait can still observe its outcome.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out waiting for the task result")]
    Timeout,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("session failed while waiting: {0}")]
    Session(String),
}

/// A handle to a pending or completed task outcome
pub trait TaskFuture: Send + Sync {
    /// Block until the outcome is available or `timeout` elapses, then
    /// return the value or the captured task error
    fn result(&self, timeout: Option<Duration>) -> Result<Payload, WaitError>;

    /// Like [`TaskFuture::result`] but returns the captured error instead of
    /// failing on it; `None` means the task succeeded
    fn error(&self, timeout: Option<Duration>) -> Result<Option<TaskError>, WaitError>;

    /// True once the outcome has been recorded; never blocks, never reverts
    fn done(&self) -> bool;
}

fn outcome_to_result(outcome: TaskOutcome) -> Result<Payload, WaitError> {
    outcome.map_err(WaitError::Task)
}

/// Future whose outcome was known at creation
pub struct ImmediateFuture {
    outcome: TaskOutcome,
}

impl ImmediateFuture {
    pub fn new(outcome: TaskOutcome) -> Self {
        Self { outcome }
    }
}

impl TaskFuture for ImmediateFuture {
    fn result(&self, _timeout: Option<Duration>) -> Result<Payload, WaitError> {
        outcome_to_result(self.outcome.clone())
    }

    fn error(&self, _timeout: Option<Duration>) -> Result<Option<TaskError>, WaitError> {
        Ok(self.outcome.as_ref().err().cloned())
    }

    fn done(&self) -> bool {
        true
    }
}

/// Write-once outcome cell shared between a worker and the futures waiting
/// on it
pub(crate) struct Slot {
    state: Mutex<Option<TaskOutcome>>,
    cond: Condvar,
}

impl Slot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// Record the outcome and wake all waiters. The first write wins; a task
    /// completes exactly once.
    pub fn complete(&self, outcome: TaskOutcome) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.cond.notify_all();
        }
    }

    pub fn try_get(&self) -> Option<TaskOutcome> {
        self.state.lock().clone()
    }

    /// Condition-variable wait, bounded by `timeout` if given
    pub fn wait(&self, timeout: Option<Duration>) -> Result<TaskOutcome, WaitError> {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while state.is_none() {
                    self.cond.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while state.is_none() {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.clone().ok_or(WaitError::Timeout);
                    }
                }
            }
        }
        // Loop exits only with a recorded outcome.
        state.clone().ok_or(WaitError::Timeout)
    }
}

/// Future backed by a local single-worker pool
pub struct PooledFuture {
    slot: Arc<Slot>,
}

impl PooledFuture {
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        Self { slot }
    }
}

impl TaskFuture for PooledFuture {
    fn result(&self, timeout: Option<Duration>) -> Result<Payload, WaitError> {
        outcome_to_result(self.slot.wait(timeout)?)
    }

    fn error(&self, timeout: Option<Duration>) -> Result<Option<TaskError>, WaitError> {
        Ok(self.slot.wait(timeout)?.err())
    }

    fn done(&self) -> bool {
        self.slot.try_get().is_some()
    }
}

/// Performs the batched-retrieval round trip for remote futures
pub(crate) trait RemoteWaiter: Send + Sync {
    /// Block until the result for `id` has been delivered into its slot or
    /// the timeout elapses
    fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Result<(), WaitError>;
}

/// Future backed by a network round trip, identified by a session-local id
pub struct RemoteFuture {
    id: TaskId,
    slot: Arc<Slot>,
    waiter: Arc<dyn RemoteWaiter>,
}

impl RemoteFuture {
    pub(crate) fn new(id: TaskId, slot: Arc<Slot>, waiter: Arc<dyn RemoteWaiter>) -> Self {
        Self { id, slot, waiter }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    fn resolve(&self, timeout: Option<Duration>) -> Result<TaskOutcome, WaitError> {
        if let Some(outcome) = self.slot.try_get() {
            return Ok(outcome);
        }
        self.waiter.wait_for(self.id, timeout)?;
        self.slot
            .try_get()
            .ok_or_else(|| WaitError::Session("result batch did not deliver the task".into()))
    }
}

impl TaskFuture for RemoteFuture {
    fn result(&self, timeout: Option<Duration>) -> Result<Payload, WaitError> {
        outcome_to_result(self.resolve(timeout)?)
    }

    fn error(&self, timeout: Option<Duration>) -> Result<Option<TaskError>, WaitError> {
        Ok(self.resolve(timeout)?.err())
    }

    fn done(&self) -> bool {
        self.slot.try_get().is_some()
    }
}

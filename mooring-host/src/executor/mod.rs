//! The executor family
//!
//! Four variants behind one contract: `run` blocks until the method
//! completes and propagates its failure unmodified; `submit` never blocks
//! beyond enqueuing and returns a future. Each executor owns exactly one
//! live service instance for its lifetime.

mod local;
mod process;
mod remote;
mod threaded;

pub use local::LocalServiceExecutor;
pub use process::{run_worker, ProcessError, ProcessServiceExecutor, WorkerRequest, WorkerResponse};
pub use remote::{RemoteError, RemoteServiceExecutor};
pub use threaded::ThreadedServiceExecutor;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use mooring_api::{FrameError, Payload, PayloadError, TaskError};

use crate::future::{TaskFuture, WaitError};
use crate::pool::WorkerGone;

/// Failures surfaced by `run` and `submit`
#[derive(Debug, Error)]
pub enum CallError {
    /// The plugin method itself failed; propagated exactly as captured
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    WorkerGone(#[from] WorkerGone),

    #[error(transparent)]
    Transport(#[from] FrameError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<WaitError> for CallError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Task(task) => CallError::Task(task),
            WaitError::Timeout => CallError::Protocol("unbounded wait timed out".into()),
            WaitError::Session(message) => CallError::Protocol(message),
        }
    }
}

/// Uniform execution contract over one live service instance
pub trait ServiceExecutor: Send + Sync {
    /// Invoke synchronously; blocks the caller until completion
    fn run(&self, method: &str, args: Payload) -> Result<Payload, CallError>;

    /// Invoke asynchronously; returns a future without waiting for the
    /// method to run
    fn submit(&self, method: &str, args: Payload) -> Result<Box<dyn TaskFuture>, CallError>;
}

/// Typed convenience layer over the payload-level contract
pub trait ServiceExecutorExt: ServiceExecutor {
    fn run_typed<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
    ) -> Result<R, CallError> {
        let result = self.run(method, Payload::encode(args)?)?;
        Ok(result.decode()?)
    }

    fn submit_typed<A: Serialize>(
        &self,
        method: &str,
        args: &A,
    ) -> Result<Box<dyn TaskFuture>, CallError> {
        self.submit(method, Payload::encode(args)?)
    }
}

impl<T: ServiceExecutor + ?Sized> ServiceExecutorExt for T {}

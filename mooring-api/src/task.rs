//! Task identifiers, outcomes and results
//!
//! A task is one method invocation submitted to an executor. Its id is
//! assigned by the submitting session, monotonically from 0, and is never
//! reused within that session. The outcome is always an explicit tagged
//! `Result`; value and error are mutually exclusive by construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Payload;

/// Session-local task identifier
pub type TaskId = u64;

/// An error raised by a plugin method, carried across execution boundaries
///
/// Native error values cannot cross process or network boundaries, so the
/// description travels instead. It is surfaced to the caller only when the
/// future is consulted, never at the point of capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What a finished task produced
pub type TaskOutcome = Result<Payload, TaskError>;

/// A finished task, keyed by id so completion order may differ from
/// submission order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    pub outcome: TaskOutcome,
}

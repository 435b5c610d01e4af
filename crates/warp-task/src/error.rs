//! Errors raised by the task kernel.
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} already started")] AlreadyStarted(String),
    #[error("task {0} was stopped before it started")] StoppedBeforeStart(String),
    #[error("task {name} did not stop within {timeout:?}")] StopTimeout { name: String, timeout: Duration },
    #[error("{task}/{behaviour} failed: {reason}")] Fault { task: String, behaviour: String, reason: String },
    #[error("{task}/{behaviour} panicked: {reason}")] Panicked { task: String, behaviour: String, reason: String },
    #[error("child {child} of {task} failed: {source}")] ChildFailed { task: String, child: String, source: Box<TaskError> },
    #[error("{hook} hook of {task} failed: {reason}")] Hook { task: String, hook: &'static str, reason: String },
    #[error("task {0} has no worker pool")] NoPool(String),
    #[error("cancelled")] Cancelled,
    #[error("{0}")] Failed(String),
}

impl TaskError {
    /// Wrap any displayable error as a behaviour failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }

    /// Shutdown in progress. Never treated as a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

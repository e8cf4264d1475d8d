use std::time::Duration;

use thiserror::Error;

/// Errors that prevent a run (or one of its building blocks) from being set up.
///
/// Only configuration-time problems are fatal. Everything that goes wrong while
/// tasks are executing ends up in the statistics as a failure instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid run configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("a task set needs at least one task")]
    EmptyTaskSet,
    #[error("invalid task `{name}`: {reason}")]
    InvalidTask { name: String, reason: String },
    #[error("control loop terminated abnormally: {0}")]
    ControlLoop(#[from] tokio::task::JoinError),
}

/// Reasons a [`RunConfig`](crate::RunConfig) is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ramp schedule is empty")]
    EmptySchedule,
    #[error("ramp schedule goes back in time at checkpoint {index} ({at:?} after {previous:?})")]
    NonMonotonicSchedule {
        index: usize,
        previous: Duration,
        at: Duration,
    },
    #[error("spawn rate must be a positive finite number of users per second, got {0}")]
    InvalidSpawnRate(f64),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("wait range is inverted: min {min:?} > max {max:?}")]
    InvertedWaitRange { min: Duration, max: Duration },
}

/// Failure of a single task execution.
///
/// Never fatal: the user loop turns it into a failed outcome and moves on.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Shorthand for task bodies that fail for their own reasons.
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other(reason.into())
    }

    /// Whether this failure is the transport's own cancellation signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Aborted))
    }
}

/// Errors surfaced by a [`Transport`](crate::Transport).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("request aborted")]
    Aborted,
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Failed(String),
}

use std::{sync::Arc, time::Duration};

use crate::{error::TaskError, user::UserId};

/// Whether a task execution succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure { reason: String },
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// An `Outcome` is the recorded result of one task execution.
///
/// Outcomes are the most granular piece of data in a run. Each one is produced
/// exactly once by a [`SimulatedUser`](crate::SimulatedUser) and handed to the
/// [`StatsRecorder`](crate::StatsRecorder), which folds it into per-task
/// [`TaskAggregate`](crate::aggregate::TaskAggregate)s. Outcomes are immutable
/// values; nothing keeps them around after they are recorded.
///
/// `started_at` is an offset from the run clock's epoch, see
/// [`ClockSource`](crate::ClockSource).
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Name of the task that produced this outcome.
    pub task: Arc<str>,
    /// The user that executed the task.
    pub user: UserId,
    pub started_at: Duration,
    pub duration: Duration,
    pub status: Status,
    /// Bytes received while executing the task.
    pub response_size: u64,
}

impl Outcome {
    /// Builds an outcome from a task body's result.
    pub fn from_result(
        task: Arc<str>,
        user: UserId,
        started_at: Duration,
        duration: Duration,
        response_size: u64,
        result: &Result<(), TaskError>,
    ) -> Self {
        let status = match result {
            Ok(()) => Status::Success,
            Err(e) => Status::Failure {
                reason: e.to_string(),
            },
        };
        Self {
            task,
            user,
            started_at,
            duration,
            status,
            response_size,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn failure_reason_comes_from_the_error() {
        let outcome = Outcome::from_result(
            "hello".into(),
            UserId(3),
            Duration::from_secs(1),
            Duration::from_millis(20),
            0,
            &Err(TransportError::Timeout.into()),
        );

        assert!(!outcome.is_success());
        assert_eq!(
            outcome.status,
            Status::Failure {
                reason: "request timed out".to_string()
            }
        );
    }

    #[test]
    fn success_keeps_size_and_timing() {
        let outcome = Outcome::from_result(
            "world".into(),
            UserId(1),
            Duration::from_millis(5),
            Duration::from_millis(7),
            512,
            &Ok(()),
        );

        assert!(outcome.is_success());
        assert_eq!(outcome.response_size, 512);
        assert_eq!(outcome.duration, Duration::from_millis(7));
        assert_eq!(&*outcome.task, "world");
    }
}

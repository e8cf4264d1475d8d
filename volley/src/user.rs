use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use rand::Rng;
use tokio::{
    sync::watch::{self, Receiver, Sender},
    task::JoinHandle,
};
use tracing::Instrument;
use typed_builder::TypedBuilder;
use volley_macros::report_tag;

use crate::{
    clock::{SharedClock, TokioClock},
    error::{ConfigError, TaskError},
    metric::Outcome,
    stats::StatsRecorder,
    task::{TaskContext, TaskCursor, TaskSet},
    transport::Transport,
};

/// Unique handle of a simulated user within a run.
#[report_tag]
#[derive(PartialOrd, Ord, Default)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

/// Lifecycle of a simulated user: `Idle -> Running -> (Stopping -> Stopped | Stopped)`.
#[report_tag]
#[repr(u8)]
pub enum UserStatus {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

#[derive(Debug)]
struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    fn new(status: UserStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> UserStatus {
        match self.0.load(Ordering::Acquire) {
            0 => UserStatus::Idle,
            1 => UserStatus::Running,
            2 => UserStatus::Stopping,
            _ => UserStatus::Stopped,
        }
    }

    fn store(&self, status: UserStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: UserStatus, to: UserStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// How long a user pauses between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WaitTime {
    /// Start the next task right away.
    #[default]
    Zero,
    /// Always wait the same amount.
    Constant(Duration),
    /// Wait a uniformly random amount in `min..=max`.
    Between { min: Duration, max: Duration },
    /// Start tasks at a fixed period: wait whatever is left of `period` after
    /// the task finished, nothing if the task took longer.
    Pacing(Duration),
}

impl WaitTime {
    pub fn between(min: Duration, max: Duration) -> Self {
        Self::Between { min, max }
    }

    /// The pause before the next task, given how long the last one took.
    pub fn next_delay<R: Rng>(&self, rng: &mut R, task_duration: Duration) -> Duration {
        match *self {
            Self::Zero => Duration::ZERO,
            Self::Constant(d) => d,
            Self::Between { min, max } if min >= max => min,
            Self::Between { min, max } => {
                // spans beyond u64 nanoseconds (~584 years) are capped
                let span = u64::try_from((max - min).as_nanos()).unwrap_or(u64::MAX);
                min.saturating_add(Duration::from_nanos(rng.random_range(0..=span)))
            }
            Self::Pacing(period) => period.saturating_sub(task_duration),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Between { min, max } if min > max => {
                Err(ConfigError::InvertedWaitRange { min, max })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Run,
    Graceful,
    Forced,
}

/// How a user's execution loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserExit {
    /// Stopped at a task boundary; every started task was recorded.
    Graceful,
    /// The in-flight task, if any, was abandoned and its outcome discarded.
    Forced,
}

/// One independent actor replaying tasks against the target.
///
/// A user repeatedly picks a task from its [`TaskSet`], runs it through the
/// shared [`Transport`], records the [`Outcome`] and then pauses according to
/// its [`WaitTime`]. Task failures and panics become failed outcomes; only a
/// stop signal ends the loop.
///
/// # Stop latency
/// - A forced stop is observed at the next poll of the user task: the in-flight
///   task future is dropped on the spot.
/// - A graceful stop is observed at the next suspension point outside a task:
///   immediately while waiting between tasks, otherwise as soon as the current
///   task completes.
#[derive(TypedBuilder)]
pub struct SimulatedUser<T: Transport> {
    id: UserId,
    task_set: Arc<TaskSet<T>>,
    transport: Arc<T>,
    stats: StatsRecorder,
    #[builder(default = TokioClock::shared())]
    clock: SharedClock,
    #[builder(default)]
    wait: WaitTime,
    #[builder(default = TaskCursor::from_entropy())]
    cursor: TaskCursor,
}

impl<T: Transport> SimulatedUser<T> {
    pub fn id(&self) -> UserId {
        self.id
    }

    /// A user that has not been started is always idle.
    pub fn status(&self) -> UserStatus {
        UserStatus::Idle
    }

    /// Moves the user to `Running` and spawns its execution loop on the
    /// current tokio runtime.
    pub fn start(self) -> UserHandle {
        let id = self.id;
        let (stop_tx, stop_rx) = watch::channel(StopSignal::Run);
        let status = Arc::new(AtomicStatus::new(UserStatus::Running));
        let join = tokio::spawn(self.run(stop_rx, Arc::clone(&status)).in_current_span());
        UserHandle {
            id,
            status,
            stop: stop_tx,
            join,
        }
    }

    async fn run(mut self, mut stop: Receiver<StopSignal>, status: Arc<AtomicStatus>) -> UserExit {
        tracing::debug!("User {} started.", self.id);
        let received = Arc::new(AtomicU64::new(0));

        let exit = loop {
            if stop.has_changed().is_err() {
                tracing::debug!("User {} lost its handle, stopping.", self.id);
                break UserExit::Forced;
            }
            let signal = *stop.borrow();
            match signal {
                StopSignal::Run => {}
                StopSignal::Graceful => break UserExit::Graceful,
                StopSignal::Forced => break UserExit::Forced,
            }

            let task = self.task_set.next_task(&mut self.cursor).clone();
            received.store(0, Ordering::Relaxed);
            let ctx =
                TaskContext::new(self.id, Arc::clone(&self.transport), Arc::clone(&received));

            let started = self.clock.now();
            let execution = AssertUnwindSafe(task.execute(ctx)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = stop.wait_for(|s| *s == StopSignal::Forced) => {
                    tracing::debug!("User {} abandoned task {}.", self.id, task.name());
                    break UserExit::Forced;
                }
                result = execution => result,
            };
            let duration = self.clock.now().saturating_duration_since(started);
            let result =
                result.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));

            let stopping = *stop.borrow() != StopSignal::Run;
            if stopping && matches!(&result, Err(e) if e.is_abort()) {
                tracing::debug!(
                    "User {} discarding task {} aborted during stop.",
                    self.id,
                    task.name()
                );
            } else {
                self.stats.record(&Outcome::from_result(
                    task.shared_name(),
                    self.id,
                    self.clock.offset_of(started),
                    duration,
                    received.load(Ordering::Relaxed),
                    &result,
                ));
            }

            let delay = self.wait.next_delay(self.cursor.rng_mut(), duration);
            if delay.is_zero() {
                // keep zero-wait users from monopolizing a worker thread
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    biased;
                    _ = stop.wait_for(|s| *s != StopSignal::Run) => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        };

        status.store(UserStatus::Stopped);
        tracing::debug!("User {} stopped ({exit:?}).", self.id);
        exit
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The coordinator's side of a running user: stop signaling and status only.
#[derive(Debug)]
pub struct UserHandle {
    id: UserId,
    status: Arc<AtomicStatus>,
    stop: Sender<StopSignal>,
    join: JoinHandle<UserExit>,
}

impl UserHandle {
    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn status(&self) -> UserStatus {
        self.status.load()
    }

    /// Asks the user to stop.
    ///
    /// A graceful stop lets the in-flight task finish and be recorded. A forced
    /// stop abandons it; a forced stop also overrides an earlier graceful one.
    pub fn stop(&self, graceful: bool) {
        if graceful {
            self.status.transition(UserStatus::Running, UserStatus::Stopping);
            self.stop.send_if_modified(|s| match s {
                StopSignal::Run => {
                    *s = StopSignal::Graceful;
                    true
                }
                _ => false,
            });
        } else {
            self.stop.send_if_modified(|s| match s {
                StopSignal::Forced => false,
                _ => {
                    *s = StopSignal::Forced;
                    true
                }
            });
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Kills the user task outright. Used for stragglers that ignored a stop.
    pub(crate) fn abort(&self) {
        self.join.abort();
        self.status.store(UserStatus::Stopped);
    }

    pub(crate) fn join_mut(&mut self) -> &mut JoinHandle<UserExit> {
        &mut self.join
    }

    /// Waits for the user loop to end.
    pub async fn join(self) -> Result<UserExit, tokio::task::JoinError> {
        self.join.await
    }
}

//! The run lifecycle: spawning users, converging on the target, reporting and
//! shutting down.
//!
//! A [`Coordinator`] is consumed by [`start`](Coordinator::start), which
//! spawns a single control task owning every piece of run bookkeeping and
//! hands back a [`RunHandle`]. The control task wakes up on two timers:
//!
//! - every `spawn_tick` it asks the [`RateController`] for the target user
//!   count and converges on it, spawning new users no faster than
//!   `spawn_rate` and gracefully stopping surplus ones, newest first;
//! - every `report_interval` it closes the current statistics window and
//!   sends it to the [`ReportSink`].
//!
//! The run ends on [`RunHandle::stop`], when the `run_time` elapses or when the
//! handle is dropped (which counts as a graceful stop). Users then get
//! `stop_timeout` to wind down; whoever is still running afterwards is aborted
//! and reported in the [`FinalReport`].
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use futures::future::join_all;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::Instrument;
use volley_macros::report_tag;

use crate::{
    clock::{SharedClock, TokioClock},
    config::RunConfig,
    error::Error,
    rate::{RateController, calc_spawn_budget},
    report::{FinalReport, ReportSink, RunWarning, StatsSnapshot},
    stats::StatsRecorder,
    task::{TaskCursor, TaskSet},
    transport::Transport,
    user::{SimulatedUser, UserHandle, UserId},
};

/// Lifecycle of a run.
#[report_tag]
pub enum RunStatus {
    /// Not started yet.
    Idle,
    Running,
    /// Users have been told to stop and are winding down.
    Stopping,
    /// Every user has ended and the final report was produced.
    Stopped,
}

#[derive(Debug)]
enum Command {
    Stop { graceful: bool },
}

/// Drives one run of a task set against a transport.
///
/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use volley::{
///     Coordinator, LoadProfile, MockTransport, RunConfig, TaskSet, TaskSpec, TracingSink,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), volley::Error> {
///     let hello = TaskSpec::<MockTransport>::new("hello", 1, |ctx| async move {
///         ctx.execute("/hello").await?;
///         Ok(())
///     });
///     let tasks = TaskSet::weighted(vec![hello])?;
///
///     let config = RunConfig::builder()
///         .load(LoadProfile::Fixed(10))
///         .spawn_rate(5.0)
///         .run_time(Duration::from_secs(30))
///         .build();
///
///     let report = Coordinator::new(tasks, MockTransport::builder().build(), TracingSink)
///         .start(config)?
///         .wait()
///         .await?;
///     println!("{} tasks", report.totals.count);
///     Ok(())
/// }
/// ```
pub struct Coordinator<T: Transport, S: ReportSink> {
    task_set: Arc<TaskSet<T>>,
    transport: Arc<T>,
    sink: S,
    clock: Option<SharedClock>,
}

impl<T: Transport, S: ReportSink> Coordinator<T, S> {
    pub fn new(task_set: TaskSet<T>, transport: impl Into<Arc<T>>, sink: S) -> Self {
        Self {
            task_set: Arc::new(task_set),
            transport: transport.into(),
            sink,
            clock: None,
        }
    }

    /// Uses `clock` instead of a [`TokioClock`] whose epoch is the run start.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// A coordinator that has not been started is always idle.
    pub fn status(&self) -> RunStatus {
        RunStatus::Idle
    }

    /// Validates `config` and starts the run.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn start(self, config: RunConfig) -> Result<RunHandle, Error> {
        config.validate()?;
        let controller = config.load.controller()?;

        let clock = self.clock.unwrap_or_else(TokioClock::shared);
        let stats = StatsRecorder::new(Arc::clone(&clock));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let active = Arc::new(AtomicUsize::new(0));

        tracing::info!(
            "Starting run: {:?} at up to {} users/s...",
            config.load,
            config.spawn_rate
        );
        let control = ControlLoop {
            task_set: self.task_set,
            transport: self.transport,
            sink: self.sink,
            clock,
            stats: stats.clone(),
            controller,
            config,
            users: Vec::new(),
            stopping: Vec::new(),
            next_id: 0,
            fractional: 0.0,
            peak_users: 0,
            active: Arc::clone(&active),
            status: status_tx,
        };
        let join = tokio::spawn(
            control
                .run(commands_rx)
                .instrument(tracing::info_span!("run")),
        );

        Ok(RunHandle {
            commands: commands_tx,
            status: status_rx,
            active,
            stats,
            join,
        })
    }
}

/// Control over a started run.
///
/// Dropping the handle stops the run gracefully; the final report still goes
/// to the sink.
#[derive(Debug)]
pub struct RunHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<RunStatus>,
    active: Arc<AtomicUsize>,
    stats: StatsRecorder,
    join: JoinHandle<FinalReport>,
}

impl RunHandle {
    /// Stops the run. A graceful stop lets every in-flight task complete and
    /// be recorded, a forced one abandons them.
    ///
    /// A forced stop sent while a graceful one is in progress abandons the
    /// tasks still in flight. Any other repeated stop has no effect.
    pub fn stop(&self, graceful: bool) {
        if self.commands.send(Command::Stop { graceful }).is_err() {
            tracing::debug!("Run already finished, ignoring stop.");
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Users currently running, not counting those already told to stop.
    pub fn active_users(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// The run's recorder, for reading live totals.
    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    /// Waits until the run ends on its own (`run_time`) or through another
    /// party calling [`stop`](Self::stop).
    pub async fn wait(self) -> Result<FinalReport, Error> {
        // keep the command channel open, closing it would stop the run
        let Self { commands, join, .. } = self;
        let report = join.await?;
        drop(commands);
        Ok(report)
    }

    pub async fn stop_and_wait(self, graceful: bool) -> Result<FinalReport, Error> {
        self.stop(graceful);
        self.wait().await
    }
}

struct ControlLoop<T: Transport, S: ReportSink> {
    task_set: Arc<TaskSet<T>>,
    transport: Arc<T>,
    sink: S,
    clock: SharedClock,
    stats: StatsRecorder,
    controller: Box<dyn RateController>,
    config: RunConfig,
    /// Running users in spawn order.
    users: Vec<UserHandle>,
    /// Surplus users told to stop that have not finished yet.
    stopping: Vec<UserHandle>,
    next_id: u64,
    fractional: f64,
    peak_users: usize,
    active: Arc<AtomicUsize>,
    status: watch::Sender<RunStatus>,
}

impl<T: Transport, S: ReportSink> ControlLoop<T, S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> FinalReport {
        let mut spawn_tick = tokio::time::interval(self.config.spawn_tick);
        spawn_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let report_interval = self.config.report_interval;
        let mut report_tick =
            tokio::time::interval_at(Instant::now() + report_interval, report_interval);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = self.config.run_time.map(|t| Instant::now() + t);
        let run_time = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(run_time);

        tracing::info!("Running now!");
        let graceful = loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Stop { graceful }) => break graceful,
                    None => {
                        tracing::info!("Run handle dropped.");
                        break true;
                    }
                },
                _ = &mut run_time => {
                    tracing::info!("Run time elapsed.");
                    break true;
                }
                _ = report_tick.tick() => {
                    let snapshot = self.stats.snapshot(true);
                    self.report_window(&snapshot).await;
                }
                _ = spawn_tick.tick() => self.converge(),
            }
        };

        self.shutdown(graceful, &mut commands).await
    }

    fn converge(&mut self) {
        self.reap();
        let active = self.users.len();
        let target = self.controller.target_users(self.clock.elapsed(), active);

        if target > active {
            let (spawn, fractional) = calc_spawn_budget(
                self.config.spawn_rate,
                self.config.spawn_tick,
                self.fractional,
                target - active,
            );
            self.fractional = fractional;
            for _ in 0..spawn {
                self.spawn_user();
            }
        } else {
            self.fractional = 0.0;
            if target < active {
                tracing::debug!("Stopping {} surplus users.", active - target);
                // newest first
                for user in self.users.drain(target..).rev() {
                    user.stop(true);
                    self.stopping.push(user);
                }
            }
        }

        self.peak_users = self.peak_users.max(self.users.len());
        self.active.store(self.users.len(), Ordering::Release);
    }

    fn spawn_user(&mut self) {
        let id = UserId(self.next_id);
        self.next_id += 1;
        let cursor = match self.config.seed {
            Some(seed) => TaskCursor::seeded(seed.wrapping_add(id.0)),
            None => TaskCursor::from_entropy(),
        };
        let user = SimulatedUser::builder()
            .id(id)
            .task_set(Arc::clone(&self.task_set))
            .transport(Arc::clone(&self.transport))
            .stats(self.stats.clone())
            .clock(Arc::clone(&self.clock))
            .wait(self.config.wait_time)
            .cursor(cursor)
            .build();
        self.users.push(user.start());
    }

    /// Drops the handles of users that have ended.
    fn reap(&mut self) {
        self.stopping.retain(|user| !user.is_finished());
        let before = self.users.len();
        self.users.retain(|user| !user.is_finished());
        if self.users.len() < before {
            tracing::warn!("{} users ended without being stopped.", before - self.users.len());
        }
    }

    async fn report_window(&self, snapshot: &StatsSnapshot) {
        if let Err(e) = self.sink.report_window(snapshot).await {
            tracing::warn!("Report sink failed on window: {e}");
        }
    }

    /// Stops every user and waits up to `stop_timeout` for them. A forced stop
    /// arriving during a graceful one escalates it.
    async fn shutdown(
        &mut self,
        graceful: bool,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> FinalReport {
        self.status.send_replace(RunStatus::Stopping);
        let mut users: Vec<UserHandle> =
            self.users.drain(..).chain(self.stopping.drain(..)).collect();
        self.active.store(0, Ordering::Release);

        tracing::info!(
            "Stopping {} users ({})...",
            users.len(),
            if graceful { "graceful" } else { "forced" }
        );
        for user in &users {
            user.stop(graceful);
        }

        let stop_timeout = self.config.stop_timeout;
        let deadline = Instant::now() + stop_timeout;
        let mut forced = !graceful;
        let mut listening = true;
        let finished = loop {
            tokio::select! {
                biased;
                results = join_all(
                    users
                        .iter_mut()
                        .filter(|user| !user.is_finished())
                        .map(UserHandle::join_mut),
                ) => {
                    for e in results.into_iter().filter_map(Result::err) {
                        tracing::debug!("User task ended abnormally: {e}");
                    }
                    break true;
                }
                command = commands.recv(), if listening && !forced => match command {
                    Some(Command::Stop { graceful: false }) => {
                        tracing::info!("Forcing the stop of {} users...", users.len());
                        forced = true;
                        for user in &users {
                            user.stop(false);
                        }
                    }
                    Some(Command::Stop { graceful: true }) => {}
                    None => listening = false,
                },
                _ = tokio::time::sleep_until(deadline) => break false,
            }
        };

        let mut warnings = Vec::new();
        let mut forced_aborts = 0;
        if !finished {
            for user in users.iter().filter(|user| !user.is_finished()) {
                user.abort();
                forced_aborts += 1;
            }
            if forced_aborts > 0 {
                tracing::warn!(
                    "{forced_aborts} users did not stop within {stop_timeout:?}, aborted them."
                );
                warnings.push(RunWarning::StopTimeoutExceeded {
                    stragglers: forced_aborts,
                    timeout: stop_timeout,
                });
            }
        }
        drop(users);

        tracing::info!("Processing results...");
        let last_window = self.stats.snapshot(true);
        self.report_window(&last_window).await;
        let report = FinalReport {
            totals: self.stats.totals(),
            last_window,
            elapsed: self.clock.elapsed(),
            users_spawned: self.next_id,
            peak_users: self.peak_users,
            forced_aborts,
            warnings,
        };
        if let Err(e) = self.sink.report_final(&report).await {
            tracing::warn!("Report sink failed on final report: {e}");
        }

        self.status.send_replace(RunStatus::Stopped);
        tracing::info!(
            "Done running after {:?}: {} tasks, {} failed.",
            report.elapsed,
            report.totals.count,
            report.totals.failure_count
        );
        report
    }
}

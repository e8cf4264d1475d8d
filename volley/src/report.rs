use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use volley_macros::report_data;

use crate::aggregate::TaskAggregate;

/// Error type returned by [`ReportSink`]s.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Latency distribution derived from a [`TaskAggregate`].
#[report_data]
#[derive(Default)]
pub struct LatencySummary {
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl From<&TaskAggregate> for LatencySummary {
    fn from(agg: &TaskAggregate) -> Self {
        if agg.is_empty() {
            return Self::default();
        }
        let quantile = |q: f64| Duration::from_micros(agg.latency.value_at_quantile(q));
        Self {
            min: agg.min_latency.unwrap_or_default(),
            max: agg.max_latency,
            mean: agg.total_latency.div_f64(agg.count as f64),
            p50: quantile(0.50),
            p90: quantile(0.90),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

/// Final statistics of one task within a snapshot.
#[report_data]
pub struct TaskStats {
    pub count: u64,
    pub failure_count: u64,
    pub total_bytes: u64,
    pub latency: LatencySummary,
    pub failures: BTreeMap<String, u64>,
}

impl From<&TaskAggregate> for TaskStats {
    fn from(agg: &TaskAggregate) -> Self {
        Self {
            count: agg.count,
            failure_count: agg.failure_count,
            total_bytes: agg.total_bytes,
            latency: LatencySummary::from(agg),
            failures: agg
                .failures
                .iter()
                .map(|(reason, n)| (reason.to_string(), *n))
                .collect(),
        }
    }
}

/// An immutable, point-in-time read of accumulated statistics.
///
/// `window_start` and `window_end` are offsets from the run clock's epoch. For
/// cumulative totals the window starts at zero.
#[report_data]
pub struct StatsSnapshot {
    pub window_start: Duration,
    pub window_end: Duration,
    pub count: u64,
    pub failure_count: u64,
    pub total_bytes: u64,
    /// Latency across all tasks.
    pub latency: LatencySummary,
    /// Per task name.
    pub tasks: BTreeMap<String, TaskStats>,
    /// Failure reasons across all tasks.
    pub failures: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn empty(window_start: Duration, window_end: Duration) -> Self {
        Self {
            window_start,
            window_end,
            count: 0,
            failure_count: 0,
            total_bytes: 0,
            latency: LatencySummary::default(),
            tasks: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Derives a snapshot from per-task aggregates.
    pub fn from_aggregates<'a>(
        window_start: Duration,
        window_end: Duration,
        aggregates: impl IntoIterator<Item = (&'a Arc<str>, &'a TaskAggregate)>,
    ) -> Self {
        let mut snapshot = Self::empty(window_start, window_end);
        let mut overall = TaskAggregate::new();
        for (name, agg) in aggregates {
            overall.merge(agg);
            snapshot.tasks.insert(name.to_string(), TaskStats::from(agg));
        }

        let overall = TaskStats::from(&overall);
        snapshot.count = overall.count;
        snapshot.failure_count = overall.failure_count;
        snapshot.total_bytes = overall.total_bytes;
        snapshot.latency = overall.latency;
        snapshot.failures = overall.failures;
        snapshot
    }

    pub fn window(&self) -> Duration {
        self.window_end.saturating_sub(self.window_start)
    }

    pub fn requests_per_second(&self) -> f64 {
        let secs = self.window().as_secs_f64();
        if secs > 0.0 {
            self.count as f64 / secs
        } else {
            0.0
        }
    }

    /// Share of failed executions in `[0.0, 1.0]`.
    pub fn failure_ratio(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.count as f64
        }
    }
}

/// Non-fatal problems a run finished with.
#[report_data]
pub enum RunWarning {
    /// Some users did not stop within `stop_timeout` and were aborted.
    StopTimeoutExceeded { stragglers: usize, timeout: Duration },
}

/// Everything known about a run once it has finished.
#[report_data]
pub struct FinalReport {
    /// Cumulative statistics over the whole run.
    pub totals: StatsSnapshot,
    /// The last reporting window, flushed at shutdown.
    pub last_window: StatsSnapshot,
    pub elapsed: Duration,
    pub users_spawned: u64,
    pub peak_users: usize,
    /// Users killed because they outlived `stop_timeout`.
    pub forced_aborts: usize,
    pub warnings: Vec<RunWarning>,
}

impl FinalReport {
    /// True when the run ended without warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A `ReportSink` receives statistics while a run is in progress and once at
/// the end.
///
/// Sinks are the I/O boundary of a run: the coordinator hands them immutable
/// snapshots and never looks at what they do with them. Errors returned by a
/// sink are logged and otherwise ignored, a broken sink never aborts a run.
///
/// # Example
/// ```rust
/// use volley::{FinalReport, ReportSink, StatsSnapshot, report::SinkError};
///
/// struct Quiet;
///
/// impl ReportSink for Quiet {
///     async fn report_window(&self, _: &StatsSnapshot) -> Result<(), SinkError> {
///         Ok(())
///     }
///
///     async fn report_final(&self, report: &FinalReport) -> Result<(), SinkError> {
///         println!("{} tasks", report.totals.count);
///         Ok(())
///     }
/// }
/// ```
pub trait ReportSink
where
    Self: Send + Sync + 'static,
{
    /// Called on every reporting tick with the window that just closed.
    fn report_window(
        &self,
        snapshot: &StatsSnapshot,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Called once when the run has stopped.
    fn report_final(
        &self,
        report: &FinalReport,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::io::{Stdout, Write};

    use parking_lot::Mutex;
    use serde::Serialize;
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    /// Logs windows and the final report through `tracing`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TracingSink;

    impl ReportSink for TracingSink {
        async fn report_window(&self, s: &StatsSnapshot) -> Result<(), SinkError> {
            tracing::info!(
                count = s.count,
                failures = s.failure_count,
                rps = s.requests_per_second(),
                p50 = ?s.latency.p50,
                p95 = ?s.latency.p95,
                p99 = ?s.latency.p99,
                "Window {:?}..{:?}",
                s.window_start,
                s.window_end,
            );
            Ok(())
        }

        async fn report_final(&self, r: &FinalReport) -> Result<(), SinkError> {
            tracing::info!(
                count = r.totals.count,
                failures = r.totals.failure_count,
                bytes = r.totals.total_bytes,
                users_spawned = r.users_spawned,
                peak_users = r.peak_users,
                forced_aborts = r.forced_aborts,
                "Run finished after {:?}",
                r.elapsed,
            );
            for (name, task) in &r.totals.tasks {
                tracing::info!(
                    count = task.count,
                    failures = task.failure_count,
                    mean = ?task.latency.mean,
                    p95 = ?task.latency.p95,
                    "Task {name}"
                );
            }
            for warning in &r.warnings {
                tracing::warn!("{warning:?}");
            }
            Ok(())
        }
    }

    /// Writes every window and the final report as one JSON document per line,
    /// to standard output unless built with [`JsonSink::new`].
    #[derive(Debug)]
    pub struct JsonSink<W = Stdout> {
        out: Mutex<W>,
    }

    impl JsonSink {
        pub fn stdout() -> Self {
            Self::new(std::io::stdout())
        }
    }

    impl Default for JsonSink {
        fn default() -> Self {
            Self::stdout()
        }
    }

    impl<W: Write> JsonSink<W> {
        pub fn new(out: W) -> Self {
            Self {
                out: Mutex::new(out),
            }
        }

        pub fn into_inner(self) -> W {
            self.out.into_inner()
        }

        fn write_line(&self, value: &impl Serialize) -> Result<(), SinkError> {
            let mut out = self.out.lock();
            serde_json::to_writer(&mut *out, value)?;
            out.write_all(b"\n")?;
            out.flush()?;
            Ok(())
        }
    }

    impl<W: Write + Send + 'static> ReportSink for JsonSink<W> {
        async fn report_window(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError> {
            self.write_line(snapshot)
        }

        async fn report_final(&self, report: &FinalReport) -> Result<(), SinkError> {
            self.write_line(report)
        }
    }

    /// What a [`ChannelSink`] forwards.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ReportEvent {
        Window(StatsSnapshot),
        Final(Box<FinalReport>),
    }

    /// Forwards everything to an unbounded channel, for embedding a run in a
    /// larger program or asserting on reports in tests.
    #[derive(Debug, Clone)]
    pub struct ChannelSink {
        tx: UnboundedSender<ReportEvent>,
    }

    impl ChannelSink {
        pub fn new(tx: UnboundedSender<ReportEvent>) -> Self {
            Self { tx }
        }
    }

    impl ReportSink for ChannelSink {
        async fn report_window(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError> {
            self.tx.send(ReportEvent::Window(snapshot.clone()))?;
            Ok(())
        }

        async fn report_final(&self, report: &FinalReport) -> Result<(), SinkError> {
            self.tx.send(ReportEvent::Final(Box::new(report.clone())))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metric::{Outcome, Status},
        user::UserId,
    };

    fn aggregate(latencies_ms: &[u64], failed: usize) -> TaskAggregate {
        let mut agg = TaskAggregate::new();
        for (i, ms) in latencies_ms.iter().enumerate() {
            agg.consume(&Outcome {
                task: "t".into(),
                user: UserId(0),
                started_at: Duration::ZERO,
                duration: Duration::from_millis(*ms),
                status: if i < failed {
                    Status::Failure {
                        reason: "HTTP 500".to_string(),
                    }
                } else {
                    Status::Success
                },
                response_size: 1,
            });
        }
        agg
    }

    #[test]
    fn summary_of_empty_aggregate_is_zero() {
        assert_eq!(
            LatencySummary::from(&TaskAggregate::new()),
            LatencySummary::default()
        );
    }

    #[test]
    fn percentiles_come_from_the_histogram() {
        let latencies: Vec<u64> = (1..=100).collect();
        let summary = LatencySummary::from(&aggregate(&latencies, 0));

        assert_eq!(summary.min, Duration::from_millis(1));
        assert_eq!(summary.max, Duration::from_millis(100));
        assert!(summary.mean.abs_diff(Duration::from_micros(50_500)) <= Duration::from_micros(1));
        // three significant digits
        let close = |d: Duration, ms: u64| {
            d.abs_diff(Duration::from_millis(ms)) <= Duration::from_micros(ms * 10)
        };
        assert!(close(summary.p50, 50), "p50 {:?}", summary.p50);
        assert!(close(summary.p90, 90), "p90 {:?}", summary.p90);
        assert!(close(summary.p99, 99), "p99 {:?}", summary.p99);
    }

    #[test]
    fn snapshot_combines_tasks() {
        let hello: Arc<str> = "hello".into();
        let world: Arc<str> = "world".into();
        let a = aggregate(&[10, 20], 1);
        let b = aggregate(&[30, 40, 50], 0);

        let snapshot = StatsSnapshot::from_aggregates(
            Duration::from_secs(1),
            Duration::from_secs(3),
            [(&hello, &a), (&world, &b)],
        );

        assert_eq!(snapshot.count, 5);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.total_bytes, 5);
        assert_eq!(snapshot.tasks["hello"].count, 2);
        assert_eq!(snapshot.tasks["world"].latency.max, Duration::from_millis(50));
        assert_eq!(snapshot.failures.get("HTTP 500"), Some(&1));
        assert_eq!(snapshot.window(), Duration::from_secs(2));
        assert_eq!(snapshot.requests_per_second(), 2.5);
        assert_eq!(snapshot.failure_ratio(), 0.2);
    }

    #[test]
    fn empty_window_has_no_rate() {
        let snapshot = StatsSnapshot::empty(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(snapshot.requests_per_second(), 0.0);
        assert_eq!(snapshot.failure_ratio(), 0.0);
    }

    #[test]
    fn final_report_serializes() {
        let report = FinalReport {
            totals: StatsSnapshot::empty(Duration::ZERO, Duration::from_secs(5)),
            last_window: StatsSnapshot::empty(Duration::from_secs(4), Duration::from_secs(5)),
            elapsed: Duration::from_secs(5),
            users_spawned: 3,
            peak_users: 3,
            forced_aborts: 1,
            warnings: vec![RunWarning::StopTimeoutExceeded {
                stragglers: 1,
                timeout: Duration::from_secs(1),
            }],
        };

        let json = serde_json::to_string(&report).unwrap();
        let back: FinalReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert!(!report.is_clean());
    }

    #[cfg(feature = "builtins")]
    #[tokio::test]
    async fn json_sink_writes_one_document_per_line() {
        let hello: Arc<str> = "hello".into();
        let agg = aggregate(&[10, 20, 30], 1);
        let window = StatsSnapshot::from_aggregates(
            Duration::from_secs(1),
            Duration::from_secs(2),
            [(&hello, &agg)],
        );
        let report = FinalReport {
            totals: window.clone(),
            last_window: window.clone(),
            elapsed: Duration::from_secs(2),
            users_spawned: 1,
            peak_users: 1,
            forced_aborts: 0,
            warnings: vec![],
        };

        let sink = JsonSink::new(Vec::new());
        sink.report_window(&window).await.unwrap();
        sink.report_final(&report).await.unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(serde_json::from_str::<StatsSnapshot>(lines[0]).unwrap(), window);
        assert_eq!(serde_json::from_str::<FinalReport>(lines[1]).unwrap(), report);
        assert!(text.ends_with('\n'));
    }

    #[cfg(feature = "builtins")]
    #[tokio::test]
    async fn json_sink_reports_write_errors() {
        struct Closed;

        impl std::io::Write for Closed {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = JsonSink::new(Closed);
        let window = StatsSnapshot::empty(Duration::ZERO, Duration::from_secs(1));
        assert!(sink.report_window(&window).await.is_err());
    }
}

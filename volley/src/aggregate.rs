use std::{collections::HashMap, sync::Arc, time::Duration};

use hdrhistogram::Histogram;

use crate::metric::{Outcome, Status};

/// Largest latency the histogram records, in microseconds (one hour).
/// Slower samples are clamped to it.
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;
/// Significant decimal digits kept by the latency histogram.
const SIGNIFICANT_DIGITS: u8 = 3;

/// Starts at the smallest range and grows with the slowest sample seen, so
/// idle or fast tasks stay at a few kilobytes.
fn latency_histogram() -> Histogram<u64> {
    Histogram::new(SIGNIFICANT_DIGITS).expect("constant histogram precision is valid")
}

/// A `TaskAggregate` folds [`Outcome`]s of one task into a compact, mergeable
/// representation.
///
/// Aggregates store only raw material: counters, sums, extremes and a latency
/// histogram. They never compute averages or percentiles themselves; that is
/// left to [`TaskStats`](crate::report::TaskStats), which is derived from an
/// aggregate when a snapshot is taken.
///
/// `merge` is associative and commutative, so per-shard aggregates can be
/// combined in any order.
///
/// # Memory vs accuracy
///
/// Latencies go into an HDR histogram with microsecond resolution and three
/// significant digits, which bounds the relative percentile error to 0.1%.
/// The histogram resizes on demand: 16 KiB covers samples up to 2ms and
/// every doubling of the slowest sample adds 8 KiB.
#[derive(Debug, Clone)]
pub struct TaskAggregate {
    pub count: u64,
    pub failure_count: u64,
    pub total_latency: Duration,
    pub min_latency: Option<Duration>,
    pub max_latency: Duration,
    pub total_bytes: u64,
    pub latency: Histogram<u64>,
    /// Failure reasons and how often each one occurred.
    pub failures: HashMap<Arc<str>, u64>,
}

impl TaskAggregate {
    pub fn new() -> Self {
        Self {
            count: 0,
            failure_count: 0,
            total_latency: Duration::ZERO,
            min_latency: None,
            max_latency: Duration::ZERO,
            total_bytes: 0,
            latency: latency_histogram(),
            failures: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Incorporate a single outcome.
    pub fn consume(&mut self, outcome: &Outcome) {
        self.count += 1;
        self.total_latency += outcome.duration;
        self.min_latency = Some(match self.min_latency {
            Some(min) => min.min(outcome.duration),
            None => outcome.duration,
        });
        self.max_latency = self.max_latency.max(outcome.duration);
        self.total_bytes += outcome.response_size;

        let micros = u64::try_from(outcome.duration.as_micros())
            .unwrap_or(u64::MAX)
            .min(MAX_TRACKED_MICROS);
        // saturating_record would clamp to the current range instead of growing it
        if let Err(e) = self.latency.record(micros) {
            tracing::warn!("Dropping a latency sample of {micros}µs: {e:?}");
        }

        if let Status::Failure { reason } = &outcome.status {
            self.failure_count += 1;
            match self.failures.get_mut(reason.as_str()) {
                Some(n) => *n += 1,
                None => {
                    self.failures.insert(Arc::from(reason.as_str()), 1);
                }
            }
        }
    }

    /// Incorporate every outcome in `outcomes`.
    pub fn aggregate(&mut self, outcomes: &[Outcome]) {
        outcomes.iter().for_each(|o| self.consume(o));
    }

    /// Empties the aggregate in place, keeping its allocations.
    pub fn reset(&mut self) {
        self.count = 0;
        self.failure_count = 0;
        self.total_latency = Duration::ZERO;
        self.min_latency = None;
        self.max_latency = Duration::ZERO;
        self.total_bytes = 0;
        self.latency.reset();
        self.failures.clear();
    }

    /// Combine another aggregate into this one.
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        self.count += other.count;
        self.failure_count += other.failure_count;
        self.total_latency += other.total_latency;
        self.min_latency = match (self.min_latency, other.min_latency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency = self.max_latency.max(other.max_latency);
        self.total_bytes += other.total_bytes;
        if let Err(e) = self.latency.add(&other.latency) {
            tracing::warn!("Dropping latency samples while merging histograms: {e:?}");
        }
        for (reason, n) in &other.failures {
            *self.failures.entry(Arc::clone(reason)).or_insert(0) += n;
        }
    }
}

impl Default for TaskAggregate {
    fn default() -> Self {
        Self::new()
    }
}

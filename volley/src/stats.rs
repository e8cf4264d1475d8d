use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    aggregate::TaskAggregate, clock::SharedClock, metric::Outcome, report::StatsSnapshot,
};

#[derive(Default)]
struct Shard {
    window: HashMap<Arc<str>, TaskAggregate>,
    totals: HashMap<Arc<str>, TaskAggregate>,
}

struct Inner {
    shards: Box<[Mutex<Shard>]>,
    /// Start of the current window. Also serializes snapshots against each other.
    window_start: Mutex<Duration>,
    clock: SharedClock,
}

/// Thread-safe collector of [`Outcome`]s, shared by every user of a run.
///
/// Outcomes are folded into per-task [`TaskAggregate`]s spread over a number
/// of independently locked shards, picked by the producing user. Concurrent
/// `record` calls from different users therefore rarely touch the same lock,
/// and every outcome is applied under exactly one lock: it can neither be lost
/// nor counted twice, and no snapshot ever sees half of it.
///
/// Two views are maintained side by side:
/// - the current **window**, read and optionally reset by [`snapshot`](Self::snapshot)
///   on every reporting tick,
/// - the cumulative **totals**, read by [`totals`](Self::totals) and never reset.
///
/// Cloning is cheap and yields a handle to the same recorder.
#[derive(Clone)]
pub struct StatsRecorder {
    inner: Arc<Inner>,
}

impl StatsRecorder {
    /// A recorder with four shards per CPU.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_shards(clock, num_cpus::get() * 4)
    }

    pub fn with_shards(clock: SharedClock, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        let window_start = Mutex::new(clock.elapsed());
        Self {
            inner: Arc::new(Inner {
                shards,
                window_start,
                clock,
            }),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Folds one outcome into the current window and the totals.
    pub fn record(&self, outcome: &Outcome) {
        let index = (outcome.user.0 % self.inner.shards.len() as u64) as usize;
        let mut shard = self.inner.shards[index].lock();
        shard
            .window
            .entry(Arc::clone(&outcome.task))
            .or_default()
            .consume(outcome);
        shard
            .totals
            .entry(Arc::clone(&outcome.task))
            .or_default()
            .consume(outcome);
    }

    /// Reads the current window. With `reset` the window is emptied and a new
    /// one starts at the snapshot's `window_end`; totals are left untouched.
    /// Tasks with no outcomes in the window are left out of the snapshot.
    ///
    /// Each shard is read (and drained) under its own lock, so an outcome
    /// recorded while a snapshot is in progress lands either in this window or
    /// in the next one, never in both and never in neither.
    pub fn snapshot(&self, reset: bool) -> StatsSnapshot {
        let mut window_start = self.inner.window_start.lock();
        let window_end = self.inner.clock.elapsed();

        let mut merged: BTreeMap<Arc<str>, TaskAggregate> = BTreeMap::new();
        for shard in self.inner.shards.iter() {
            let mut shard = shard.lock();
            merge_into(&mut merged, shard.window.iter());
            if reset {
                // Entries stay so the next window reuses their histograms
                shard.window.values_mut().for_each(TaskAggregate::reset);
            }
        }

        let snapshot = StatsSnapshot::from_aggregates(*window_start, window_end, &merged);
        if reset {
            *window_start = window_end;
        }
        snapshot
    }

    /// Cumulative statistics since the recorder was created.
    pub fn totals(&self) -> StatsSnapshot {
        let window_end = self.inner.clock.elapsed();
        let mut merged: BTreeMap<Arc<str>, TaskAggregate> = BTreeMap::new();
        for shard in self.inner.shards.iter() {
            merge_into(&mut merged, shard.lock().totals.iter());
        }
        StatsSnapshot::from_aggregates(Duration::ZERO, window_end, &merged)
    }
}

fn merge_into<'a>(
    merged: &mut BTreeMap<Arc<str>, TaskAggregate>,
    aggregates: impl Iterator<Item = (&'a Arc<str>, &'a TaskAggregate)>,
) {
    for (name, agg) in aggregates.filter(|(_, agg)| !agg.is_empty()) {
        merged.entry(Arc::clone(name)).or_default().merge(agg);
    }
}

impl fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("shards", &self.inner.shards.len())
            .field("window_start", &*self.inner.window_start.lock())
            .finish_non_exhaustive()
    }
}

use std::{fmt::Debug, sync::Arc, time::Duration};

use tokio::time::Instant;

/// A monotonic time source.
///
/// Every timestamp in a run (outcome start times, snapshot windows, ramp
/// progress) is expressed as an offset from the clock's [`epoch`](ClockSource::epoch),
/// so reports stay serializable and comparable across runs.
pub trait ClockSource
where
    Self: Send + Sync + Debug,
{
    /// The current instant.
    fn now(&self) -> Instant;

    /// The instant all offsets are measured from.
    fn epoch(&self) -> Instant;

    /// Time elapsed since the epoch.
    fn elapsed(&self) -> Duration {
        self.now().saturating_duration_since(self.epoch())
    }

    /// Offset of `instant` relative to the epoch, zero if it predates it.
    fn offset_of(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(self.epoch())
    }
}

/// Shared handle to a clock, passed to every component of a run.
pub type SharedClock = Arc<dyn ClockSource>;

/// The default clock, backed by [`tokio::time::Instant`].
///
/// Because it reads tokio's clock it follows `tokio::time::pause` and
/// `advance`, which keeps time-dependent tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch: Instant,
}

impl TokioClock {
    /// A clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch(&self) -> Instant {
        self.epoch
    }
}

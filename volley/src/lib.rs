//! Volley, a small load-generation core for Rust.
//!
//! Volley runs many independent *simulated users* against a target service.
//! Each user repeatedly picks a task from a weighted task set, executes it
//! through a shared transport, records the outcome and pauses according to its
//! wait policy. A coordinator keeps the number of active users on target (a
//! fixed count or a ramp schedule), collects latency and error statistics and
//! shuts everything down cleanly when asked.
//!
//! # Architecture
//!
//! The main building blocks, leaves first:
//!
//! - [`ClockSource`]: monotonic time. Every timestamp of a run is an offset
//!   from its epoch.
//! - [`StatsRecorder`]: thread-safe, sharded collector of [`Outcome`]s with a
//!   rolling window and cumulative totals.
//! - [`TaskSet`]: the immutable collection of [`TaskSpec`]s a user draws from,
//!   weighted or sequential.
//! - [`SimulatedUser`]: one actor executing tasks until it is told to stop,
//!   gracefully or not.
//! - [`RateController`]: how many users should be active at a given time.
//! - [`Coordinator`]: owns the run. Spawns and stops users, snapshots
//!   statistics into a [`ReportSink`] and produces the [`FinalReport`].
//!
//! The protocol spoken with the target is not part of the core: task bodies go
//! through a [`Transport`], which can be anything from an HTTP client to a
//! database driver.
//!
//! # Example
//!
//! One user profile whose single task GETs `/hello` and then `/world`:
//!
//! ```rust
//! use std::time::Duration;
//!
//! use volley::{
//!     Coordinator, LoadProfile, MockTransport, RunConfig, TaskSet, TaskSpec, TracingSink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), volley::Error> {
//!     let hello_world = TaskSpec::<MockTransport>::new("hello_world", 1, |ctx| async move {
//!         ctx.execute("/hello").await?;
//!         ctx.execute("/world").await?;
//!         Ok(())
//!     });
//!     let tasks = TaskSet::weighted(vec![hello_world])?;
//!
//!     // A mock stands in for the target here, see `demos/http.rs` for the real thing.
//!     let transport = MockTransport::builder()
//!         .latency(Duration::from_millis(5))
//!         .build();
//!
//!     let config = RunConfig::builder()
//!         .load(LoadProfile::Fixed(10))
//!         .spawn_rate(100.0)
//!         .run_time(Duration::from_millis(500))
//!         .build();
//!
//!     let report = Coordinator::new(tasks, transport, TracingSink)
//!         .start(config)?
//!         .wait()
//!         .await?;
//!
//!     assert!(report.totals.count > 0);
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: re-exports the attribute macros used to declare report data
//!   types. (Enabled by default)
//! - `builtins`: [`MockTransport`] and the [`TracingSink`], [`JsonSink`] and
//!   [`ChannelSink`] report sinks. (Enabled by default)
//! - `http`: an [`HttpTransport`] backed by `reqwest`.
//! - `internals`: exposes the spawn pacing math for experimentation.

/// Latency and failure accumulation per task
pub mod aggregate;
/// Time sources
pub mod clock;
/// Run configuration
pub mod config;
/// Run lifecycle and control
pub mod coordinator;
/// Error types
pub mod error;
/// Per-execution outcomes
pub mod metric;
/// Target user counts and spawn pacing
pub mod rate;
/// Snapshots, final reports and sinks
pub mod report;
/// The shared statistics recorder
pub mod stats;
/// Tasks and task sets
pub mod task;
/// The boundary to the system under test
pub mod transport;
/// Simulated users
pub mod user;

pub use clock::{ClockSource, SharedClock, TokioClock};
pub use config::RunConfig;
pub use coordinator::{Coordinator, RunHandle, RunStatus};
pub use error::{ConfigError, Error, TaskError, TransportError};
pub use metric::{Outcome, Status};
pub use rate::{FixedTarget, LoadProfile, RampPoint, RampSchedule, RateController};
pub use report::{FinalReport, ReportSink, RunWarning, StatsSnapshot};
pub use stats::StatsRecorder;
pub use task::{Selection, TaskContext, TaskCursor, TaskSet, TaskSpec};
pub use transport::{Response, Transport};
pub use user::{SimulatedUser, UserHandle, UserId, UserStatus, WaitTime};

#[cfg(feature = "builtins")]
pub use report::{ChannelSink, JsonSink, ReportEvent, TracingSink};
#[cfg(feature = "builtins")]
pub use transport::MockTransport;
#[cfg(feature = "http")]
pub use transport::{HttpRequest, HttpTransport};

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use volley_macros::*;
}

//! Rate control: how many users should be active, and how fast to get there.
//!
//! A [`RateController`] maps elapsed run time to a target number of active
//! users. Two controllers are built in:
//!
//! - [`FixedTarget`] asks for the same number of users from the first tick on.
//! - [`RampSchedule`] linearly interpolates between `(time_offset, users)`
//!   checkpoints and holds the last checkpoint's value afterwards.
//!
//! # Mathematical behavior of the ramp
//! Between two checkpoints `(t0, u0)` and `(t1, u1)` the target at `elapsed`
//! is
//!
//! ```text
//! t = (elapsed - t0) / (t1 - t0)
//! u(t) = round(u0 + (u1 - u0) * t)
//! ```
//!
//! Before the first checkpoint the ramp starts from `(0, 0)`. Two checkpoints
//! with the same offset make the target jump instantly, which allows spikes.
//!
//! # Spawn pacing
//! Reaching a target is not instantaneous. The coordinator spawns at most
//! `spawn_rate` users per second, spread over its `spawn_tick` so a ramp does
//! not turn into a connection storm:
//!
//! ```text
//! add_f = spawn_rate * tick_seconds
//! spawn = min(floor(add_f + fractional), deficit)
//! fractional = (add_f + fractional) - floor(add_f + fractional)
//! ```
//!
//! The fractional part is carried across ticks so rates that do not divide
//! the tick evenly (for example 5 users/s at 100ms ticks) still average out
//! exactly. Budget beyond the current deficit is discarded rather than banked.
use std::{fmt::Debug, time::Duration};

use crate::error::ConfigError;

/// Decides how many users should be active at a given point of the run.
///
/// `active` is the number of users currently running; the built-in
/// controllers ignore it, adaptive ones may use it.
pub trait RateController
where
    Self: Send + Sync + Debug,
{
    fn target_users(&self, elapsed: Duration, active: usize) -> usize;
}

/// The same number of users for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTarget {
    pub users: usize,
}

impl RateController for FixedTarget {
    fn target_users(&self, _elapsed: Duration, _active: usize) -> usize {
        self.users
    }
}

/// A checkpoint of a ramp schedule: `users` active at `at` into the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPoint {
    pub at: Duration,
    pub users: usize,
}

impl RampPoint {
    pub fn new(at: Duration, users: usize) -> Self {
        Self { at, users }
    }
}

/// Piecewise-linear user count over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampSchedule {
    points: Vec<RampPoint>,
}

impl RampSchedule {
    /// Checkpoints must be non-empty and ordered by time.
    pub fn new(points: Vec<RampPoint>) -> Result<Self, ConfigError> {
        validate_schedule(&points)?;
        Ok(Self { points })
    }

    pub fn points(&self) -> &[RampPoint] {
        &self.points
    }

    /// Offset of the last checkpoint, after which the target stays constant.
    pub fn ramp_end(&self) -> Duration {
        self.points.last().map(|p| p.at).unwrap_or_default()
    }
}

impl RateController for RampSchedule {
    fn target_users(&self, elapsed: Duration, _active: usize) -> usize {
        let mut previous = RampPoint::new(Duration::ZERO, 0);
        for point in &self.points {
            if elapsed < point.at {
                let span = (point.at - previous.at).as_secs_f64();
                let t = (elapsed - previous.at).as_secs_f64() / span;
                return interpolate(previous.users, point.users, t);
            }
            previous = *point;
        }
        previous.users
    }
}

fn interpolate(from: usize, to: usize, t: f64) -> usize {
    let from = from as f64;
    let to = to as f64;
    let users = from + (to - from) * t.clamp(0.0, 1.0);
    users.round().max(0.0) as usize
}

fn validate_schedule(points: &[RampPoint]) -> Result<(), ConfigError> {
    if points.is_empty() {
        return Err(ConfigError::EmptySchedule);
    }
    for (index, pair) in points.windows(2).enumerate() {
        if pair[1].at < pair[0].at {
            return Err(ConfigError::NonMonotonicSchedule {
                index: index + 1,
                previous: pair[0].at,
                at: pair[1].at,
            });
        }
    }
    Ok(())
}

/// The desired concurrency of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProfile {
    /// Keep this many users active.
    Fixed(usize),
    /// Follow a ramp schedule.
    Ramp(Vec<RampPoint>),
}

impl LoadProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Ramp(points) => validate_schedule(points),
        }
    }

    /// Builds the controller that implements this profile.
    pub fn controller(&self) -> Result<Box<dyn RateController>, ConfigError> {
        Ok(match self {
            Self::Fixed(users) => Box::new(FixedTarget { users: *users }),
            Self::Ramp(points) => Box::new(RampSchedule::new(points.clone())?),
        })
    }
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

#[cfg(not(feature = "internals"))]
pub(crate) use internals::*;

/// Spawn pacing math.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Pure function computing how many users to spawn this tick.
    ///
    /// Returns `(users_to_spawn, next_fractional_part)`. With no deficit the
    /// fractional carry is dropped as well.
    pub fn calc_spawn_budget(
        spawn_rate: f64,
        tick: Duration,
        fractional: f64,
        deficit: usize,
    ) -> (usize, f64) {
        if deficit == 0 {
            return (0, 0.0);
        }
        // Users to add this tick (as a float)
        let add_f = spawn_rate * tick.as_secs_f64();
        let total_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - total_f;

        let total = if total_f >= deficit as f64 {
            deficit
        } else if total_f < 0.0 || total_f.is_nan() {
            0
        } else {
            total_f as usize
        };
        (total, fractional.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn fixed_target_is_immediate() {
        let fixed = FixedTarget { users: 10 };
        assert_eq!(fixed.target_users(Duration::ZERO, 0), 10);
        assert_eq!(fixed.target_users(secs(3600), 10), 10);
    }

    #[test]
    fn ramp_up_is_linear() {
        let ramp = RampSchedule::new(vec![
            RampPoint::new(secs(0), 0),
            RampPoint::new(secs(10), 100),
        ])
        .unwrap();
        for i in 0..=10 {
            assert_eq!(ramp.target_users(secs(i), 0), (i * 10) as usize);
        }
    }

    #[test]
    fn ramp_is_monotonic_during_ramp_up() {
        let ramp = RampSchedule::new(vec![RampPoint::new(secs(7), 13)]).unwrap();
        let mut last = 0;
        for ms in (0..8000).step_by(10) {
            let users = ramp.target_users(Duration::from_millis(ms), 0);
            assert!(users >= last);
            last = users;
        }
        assert_eq!(last, 13);
    }

    #[test]
    fn ramp_starts_from_zero_before_first_checkpoint() {
        let ramp = RampSchedule::new(vec![RampPoint::new(secs(10), 50)]).unwrap();
        assert_eq!(ramp.target_users(Duration::ZERO, 0), 0);
        assert_eq!(ramp.target_users(secs(5), 0), 25);
        assert_eq!(ramp.target_users(secs(10), 0), 50);
    }

    #[test]
    fn ramp_down() {
        let ramp = RampSchedule::new(vec![
            RampPoint::new(secs(0), 100),
            RampPoint::new(secs(10), 0),
        ])
        .unwrap();
        for i in 0..=10 {
            assert_eq!(ramp.target_users(secs(i), 0), (100 - i * 10) as usize);
        }
    }

    #[test]
    fn clamps_to_last_checkpoint() {
        let ramp = RampSchedule::new(vec![
            RampPoint::new(secs(0), 0),
            RampPoint::new(secs(10), 40),
            RampPoint::new(secs(20), 20),
        ])
        .unwrap();
        assert_eq!(ramp.target_users(secs(15), 0), 30);
        for i in 20..30 {
            assert_eq!(ramp.target_users(secs(i), 0), 20);
        }
        assert_eq!(ramp.ramp_end(), secs(20));
    }

    #[test]
    fn equal_offsets_step_instantly() {
        let ramp = RampSchedule::new(vec![
            RampPoint::new(secs(0), 10),
            RampPoint::new(secs(5), 10),
            RampPoint::new(secs(5), 80),
        ])
        .unwrap();
        assert_eq!(ramp.target_users(Duration::from_millis(4999), 0), 10);
        assert_eq!(ramp.target_users(secs(5), 0), 80);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert_eq!(RampSchedule::new(vec![]), Err(ConfigError::EmptySchedule));
        assert_eq!(
            RampSchedule::new(vec![
                RampPoint::new(secs(0), 1),
                RampPoint::new(secs(10), 5),
                RampPoint::new(secs(3), 5),
            ]),
            Err(ConfigError::NonMonotonicSchedule {
                index: 2,
                previous: secs(10),
                at: secs(3),
            })
        );
        assert!(LoadProfile::Ramp(vec![]).controller().is_err());
        assert!(LoadProfile::Fixed(0).validate().is_ok());
    }

    mod calc_spawn_budget {
        use super::*;

        #[test]
        fn linearity() {
            let mut rate = 10.;
            let mut expected = 1;
            for _ in 0..5 {
                let (n, f) = calc_spawn_budget(rate, Duration::from_millis(100), 0., usize::MAX);
                assert_eq!(n, expected);
                assert_eq!(f, 0.);
                rate *= 10.;
                expected *= 10;
            }
        }

        #[test]
        fn fractional_accumulation() {
            let expected_fs = [0.25, 0.5, 0.75, 0.];
            let mut facc = 0.;
            for i in 0..12 {
                let (n, f) = calc_spawn_budget(12.5, Duration::from_millis(100), facc, 1000);
                facc = f;
                let expected_f = expected_fs[i % 4];
                let expected_n = if expected_f == 0. { 2 } else { 1 };
                assert_eq!(n, expected_n);
                assert_eq!(f, expected_f);
            }
        }

        #[test]
        fn slow_rate_spawns_every_other_tick() {
            // 5 users/s at 100ms ticks: one user every 200ms
            let mut facc = 0.;
            let mut spawned = vec![];
            for _ in 0..6 {
                let (n, f) = calc_spawn_budget(5., Duration::from_millis(100), facc, 10);
                facc = f;
                spawned.push(n);
            }
            assert_eq!(spawned, [0, 1, 0, 1, 0, 1]);
        }

        #[test]
        fn capped_at_deficit() {
            let (n, f) = calc_spawn_budget(1000., Duration::from_secs(1), 0., 7);
            assert_eq!(n, 7);
            assert_eq!(f, 0.);
        }

        #[test]
        fn no_deficit_drops_carry() {
            assert_eq!(
                calc_spawn_budget(5., Duration::from_millis(100), 0.5, 0),
                (0, 0.)
            );
        }

        #[test]
        fn extreme_rate_is_capped() {
            let (n, _) = calc_spawn_budget(f64::MAX, Duration::from_secs(1), 0., 3);
            assert_eq!(n, 3);
        }
    }
}

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{error::ConfigError, rate::LoadProfile, user::WaitTime};

/// Everything a run needs to know up front. Immutable once the run starts.
///
/// ```rust
/// use std::time::Duration;
/// use volley::{LoadProfile, RunConfig};
///
/// let config = RunConfig::builder()
///     .load(LoadProfile::Fixed(10))
///     .spawn_rate(5.0)
///     .run_time(Duration::from_secs(60))
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunConfig {
    /// Target user count or ramp schedule.
    pub load: LoadProfile,
    /// Users spawned per second at most while converging up to the target.
    #[builder(default = 1.0)]
    pub spawn_rate: f64,
    /// How long users get to finish gracefully before they are aborted.
    #[builder(default = Duration::from_secs(10))]
    pub stop_timeout: Duration,
    /// Stop gracefully on our own after this long.
    #[builder(default, setter(strip_option))]
    pub run_time: Option<Duration>,
    /// Granularity of the control loop: target queries, spawning and reaping.
    #[builder(default = Duration::from_millis(100))]
    pub spawn_tick: Duration,
    /// How often a window is snapshotted and sent to the sink.
    #[builder(default = Duration::from_secs(1))]
    pub report_interval: Duration,
    #[builder(default)]
    pub wait_time: WaitTime,
    /// Makes task selection and wait times reproducible. User `n` derives its
    /// random source from `seed + n`.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.load.validate()?;
        if !self.spawn_rate.is_finite() || self.spawn_rate <= 0.0 {
            return Err(ConfigError::InvalidSpawnRate(self.spawn_rate));
        }
        if self.spawn_tick.is_zero() {
            return Err(ConfigError::ZeroInterval("spawn_tick"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("report_interval"));
        }
        self.wait_time.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RampPoint;

    fn fixed(users: usize) -> RunConfig {
        RunConfig::builder().load(LoadProfile::Fixed(users)).build()
    }

    #[test]
    fn defaults() {
        let config = fixed(3);
        assert_eq!(config.spawn_rate, 1.0);
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.spawn_tick, Duration::from_millis(100));
        assert_eq!(config.report_interval, Duration::from_secs(1));
        assert_eq!(config.run_time, None);
        assert_eq!(config.wait_time, WaitTime::Zero);
        assert_eq!(config.seed, None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_spawn_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = RunConfig {
                spawn_rate: rate,
                ..fixed(1)
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidSpawnRate(_))
            ));
        }
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = RunConfig {
            spawn_tick: Duration::ZERO,
            ..fixed(1)
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("spawn_tick"))
        );

        let config = RunConfig {
            report_interval: Duration::ZERO,
            ..fixed(1)
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("report_interval"))
        );
    }

    #[test]
    fn rejects_bad_schedules_and_wait_ranges() {
        let config = RunConfig::builder()
            .load(LoadProfile::Ramp(vec![
                RampPoint::new(Duration::from_secs(5), 10),
                RampPoint::new(Duration::from_secs(1), 10),
            ]))
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonMonotonicSchedule { index: 1, .. })
        ));

        let config = RunConfig {
            wait_time: WaitTime::between(Duration::from_secs(3), Duration::from_secs(1)),
            ..fixed(1)
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedWaitRange { .. })
        ));
    }
}

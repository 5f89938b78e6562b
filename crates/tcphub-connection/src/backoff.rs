//! Jittered exponential backoff

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Floor of every delay, and the delay right after a reset
    pub min: Duration,
    /// Ceiling of every delay
    pub max: Duration,
    /// Growth factor applied per consecutive failure
    pub factor: f64,
    /// Randomize each delay between `min` and the current interval
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 1.3,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Default growth and floor with a caller-chosen ceiling.
    pub fn with_max(max: Duration) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }
}

/// Backoff state for one dialer.
///
/// The interval for attempt `n` is `min * factor^n`, clamped to
/// `[min, max]`. With jitter on, the returned delay is drawn uniformly from
/// `[min, interval]`, so the interval itself never shrinks between resets
/// even though individual sleeps vary.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to sleep before the next attempt; advances the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let interval = self.interval_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let delay = if self.config.jitter && interval > self.floor() {
            let min = self.floor().as_secs_f64();
            let spread = interval.as_secs_f64() - min;
            Duration::from_secs_f64(min + rand::thread_rng().gen::<f64>() * spread).min(interval)
        } else {
            interval
        };

        delay.clamp(self.floor(), self.ceiling())
    }

    /// Interval the next call to [`next_delay`](Self::next_delay) draws from.
    pub fn current_interval(&self) -> Duration {
        self.interval_for(self.attempt)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "Resetting backoff");
        }
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn floor(&self) -> Duration {
        self.config.min.min(self.ceiling())
    }

    fn ceiling(&self) -> Duration {
        // A ceiling below the floor collapses to the floor
        self.config.max.max(self.config.min)
    }

    fn interval_for(&self, attempt: u32) -> Duration {
        let min = self.config.min.as_secs_f64();
        let scaled = min * self.config.factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let max = self.ceiling().as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            return self.ceiling();
        }
        Duration::from_secs_f64(scaled).max(self.floor())
    }
}

//! Exponential Backoff
//!
//! Computes the delay inserted between retry attempts.

use rand::Rng;
use std::time::Duration;

/// Delays never drop below this floor, jitter included.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Maximum relative jitter applied to a delay (±25%).
const JITTER_RATIO: f64 = 0.25;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Apply ±25% uniform jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Exponential backoff calculator.
#[derive(Debug, Clone, Default)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    ///
    /// `min(base * multiplier^attempt, max)`, jittered by up to ±25% when
    /// enabled, never below [`MIN_DELAY`].
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;

        let mut delay = (base * self.config.multiplier.powi(exponent)).min(max);
        if !delay.is_finite() {
            delay = max;
        }

        if self.config.jitter && delay > 0.0 {
            let spread = delay * JITTER_RATIO;
            delay += rand::thread_rng().gen_range(-spread..=spread);
        }

        // Jitter on an uncapped delay can overshoot Duration::MAX
        Duration::try_from_secs_f64(delay.max(MIN_DELAY.as_secs_f64())).unwrap_or(Duration::MAX)
    }
}

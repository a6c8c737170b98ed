//! Retry policy: delay computation and retry decisions.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration for every task in a workflow
///
/// The delay before re-dispatching attempt `n + 1` after attempt `n` failed
/// transiently is:
///
/// ```text
/// delay_seconds * (2^(n-1) if exponential_backoff else 1) * (1 + U(-jitter, +jitter))
/// ```
///
/// clamped to be non-negative. Delays are measured from the end of the
/// failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay between attempts, in seconds
    pub delay_seconds: f64,

    /// Double the base delay for each subsequent attempt
    pub exponential_backoff: bool,

    /// Fractional randomness applied to each delay, in `[0, 1]`
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_seconds: 2.0,
            exponential_backoff: true,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay_seconds: 0.0,
            exponential_backoff: false,
            jitter_fraction: 0.0,
        }
    }

    /// Fixed-interval retries without backoff or jitter
    pub fn fixed(delay_seconds: f64, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_seconds,
            exponential_backoff: false,
            jitter_fraction: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay in seconds
    pub fn with_delay_seconds(mut self, delay_seconds: f64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    /// Enable or disable exponential backoff
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Set the jitter fraction (clamped to `[0, 1]`)
    pub fn with_jitter_fraction(mut self, jitter: f64) -> Self {
        self.jitter_fraction = jitter.clamp(0.0, 1.0);
        self
    }

    /// Check the policy's field constraints
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.delay_seconds.is_finite() || self.delay_seconds < 0.0 {
            return Err(format!(
                "delay_seconds must be a non-negative number, got {}",
                self.delay_seconds
            ));
        }
        if !self.jitter_fraction.is_finite()
            || !(0.0..=1.0).contains(&self.jitter_fraction)
        {
            return Err(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        Ok(())
    }

    /// Whether another attempt is permitted after `attempt` attempts have run
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the failure of 1-based attempt number `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62);
        let base = if self.exponential_backoff {
            self.delay_seconds * 2f64.powi(exponent as i32)
        } else {
            self.delay_seconds
        };

        let jittered = if self.jitter_fraction > 0.0 {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
            base * (1.0 + factor)
        } else {
            base
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

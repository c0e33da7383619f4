//! Backoff between connection attempts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy between failed connection attempts
///
/// Attempts are retried indefinitely; only cancellation stops the loop.
/// The default is a flat two-second pause with up to 25% jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt (default: 2000ms)
    pub backoff_initial_ms: u64,
    /// Upper bound on the delay (default: 2000ms)
    pub backoff_max_ms: u64,
    /// Growth factor per attempt (default: 1.0, i.e. constant)
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter (default: true)
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 2000,
            backoff_max_ms: 2000,
            backoff_multiplier: 1.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy for flaky networks
    pub fn exponential() -> Self {
        Self {
            backoff_initial_ms: 500,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }

    /// Constant delay without jitter
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            backoff_initial_ms: ms,
            backoff_max_ms: ms,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Backoff before retrying after `attempt` (0-indexed) failed
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64).max(0.0);

        let final_ms = if self.jitter_enabled && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

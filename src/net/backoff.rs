//! Reconnect Backoff
//!
//! Exponential backoff with jitter for reconnect attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSettings;

/// Exponential backoff state for one connection.
///
/// `delay = min(base * 2^attempt, max)`, with a symmetric jitter of up to
/// `jitter_percent` applied on top. The attempt counter is reset only
/// after a fully successful handshake.
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    /// The deterministic (pre-jitter) delay for a given attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20); // avoid overflow; cap dominates anyway
        let delay_ms = self
            .settings
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.settings.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Consume one attempt and return the jittered delay to sleep.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay(self.attempt);
        self.attempt += 1;

        if self.settings.jitter_percent == 0 {
            return raw;
        }
        let jitter_span = raw.as_millis() as u64 * u64::from(self.settings.jitter_percent) / 100;
        if jitter_span == 0 {
            return raw;
        }
        let offset = rand::thread_rng().gen_range(0..=jitter_span * 2) as i64 - jitter_span as i64;
        let jittered = (raw.as_millis() as i64 + offset).max(0) as u64;
        Duration::from_millis(jittered)
    }

    /// Attempts consumed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt budget is exhausted.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.settings.max_attempts
    }

    /// Reset after a fully successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

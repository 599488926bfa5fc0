use std::time::Duration;

use rand::Rng;

use crate::TunnelError;

/// Exponential backoff policy with a bounded interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First delay.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Growth factor between attempts.
    pub multiplier: u32,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: Some(8),
        }
    }
}

impl BackoffConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TunnelError> {
        if self.initial.is_zero() || self.max < self.initial {
            return Err(TunnelError::Config(
                "backoff requires 0 < initial <= max".into(),
            ));
        }
        if self.multiplier == 0 {
            return Err(TunnelError::Config("backoff multiplier must be >= 1".into()));
        }
        Ok(())
    }
}

/// Stateful backoff iterator. Each delay carries ±20% jitter so that peers
/// losing the same link do not redial in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(limit) = self.config.max_attempts {
            if self.attempt >= limit {
                return None;
            }
        }
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter: f64 = rand::rng().random_range(0.8..1.2);
        Some(base.mul_f64(jitter).min(self.config.max))
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.multiplier.saturating_pow(attempt);
        self.config
            .initial
            .checked_mul(factor)
            .unwrap_or(self.config.max)
            .min(self.config.max)
    }
}

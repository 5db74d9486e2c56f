use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do with a record after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  RetryAt(DateTime<Utc>),
  DeadLetter,
}

/// Capped exponential backoff with a dead-letter bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base: Duration,
  pub max_delay: Duration,
  /// Failed attempts after which a record is dead-lettered
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(2),
      max_delay: Duration::from_secs(300),
      max_attempts: 8,
    }
  }
}

impl RetryPolicy {
  /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    self.base.saturating_mul(factor).min(self.max_delay)
  }

  pub fn decide(&self, attempt: u32, now: DateTime<Utc>) -> RetryDecision {
    if attempt >= self.max_attempts {
      return RetryDecision::DeadLetter;
    }
    let delay = chrono::Duration::from_std(self.delay_for(attempt))
      .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
    RetryDecision::RetryAt(now + delay)
  }
}

//! What to do with an operation whose replay failed.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::config::SyncConfig;

/// Why a replay failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
  /// No response at all (offline, refused, reset)
  Transport(String),
  /// The server answered with a non-2xx status
  Status(u16),
}

impl Failure {
  /// The server understood the request and rejected it; sending it again
  /// won't change the answer.
  pub fn is_permanent(&self) -> bool {
    match self {
      Failure::Transport(_) => false,
      Failure::Status(status) => (400..500).contains(status) && *status != 408 && *status != 429,
    }
  }

  /// Only answers from the server use up attempts. Being offline never
  /// makes an operation fail for good.
  pub fn counts_attempt(&self) -> bool {
    matches!(self, Failure::Status(_))
  }
}

impl fmt::Display for Failure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Failure::Transport(e) => write!(f, "network error: {}", e),
      Failure::Status(status) => write!(f, "HTTP {}", status),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// Back to the queue, due at the given time
  Retry(DateTime<Utc>),
  /// Terminal failure
  Abandon,
}

/// Bounded retries with exponential backoff for server-side failures;
/// network errors retry after the base delay, without limit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      base_delay: Duration::from_secs(config.base_delay_secs),
      max_delay: Duration::from_secs(config.max_delay_secs),
    }
  }

  /// Delay before attempt `attempts + 1`: base * 2^(attempts - 1), capped.
  pub fn delay(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    self
      .base_delay
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// `attempts` counts the server-side failures so far, including this one
  /// when it is one.
  pub fn decide(&self, attempts: u32, failure: &Failure, now: DateTime<Utc>) -> Disposition {
    match failure {
      Failure::Transport(_) => Disposition::Retry(after(now, self.base_delay)),
      _ if failure.is_permanent() || attempts >= self.max_attempts => Disposition::Abandon,
      _ => Disposition::Retry(after(now, self.delay(attempts))),
    }
  }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
  let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
  now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

//! Capped exponential backoff.

use chrono::Duration;

/// Retry delay policy: `min(base * 2^attempts, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub base: Duration,
  pub max_delay: Duration,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base: Duration::milliseconds(1_000),
      max_delay: Duration::seconds(60),
    }
  }
}

impl BackoffPolicy {
  /// Delay to wait after the `attempts`-th failure.
  pub fn delay(&self, attempts: u32) -> Duration {
    backoff(self.base, self.max_delay, attempts)
  }
}

/// Delay before the next retry after `attempts` failures. Saturates at `max_delay`.
pub fn backoff(base: Duration, max_delay: Duration, attempts: u32) -> Duration {
  let base_ms = base.num_milliseconds().max(0);
  let max_ms = max_delay.num_milliseconds().max(0);
  if base_ms == 0 {
    return Duration::zero();
  }

  let delay_ms = 1_i64
    .checked_shl(attempts)
    .filter(|factor| *factor > 0)
    .and_then(|factor| base_ms.checked_mul(factor))
    .unwrap_or(i64::MAX);

  Duration::milliseconds(delay_ms.min(max_ms))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_doubles_per_attempt() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay(0), Duration::milliseconds(1_000));
    assert_eq!(policy.delay(1), Duration::milliseconds(2_000));
    assert_eq!(policy.delay(3), Duration::milliseconds(8_000));
  }

  #[test]
  fn test_caps_at_max_delay() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay(6), Duration::seconds(60));
    assert_eq!(policy.delay(40), Duration::seconds(60));
    assert_eq!(policy.delay(u32::MAX), Duration::seconds(60));
  }

  #[test]
  fn test_zero_base_never_waits() {
    let d = backoff(Duration::zero(), Duration::seconds(10), 5);
    assert_eq!(d, Duration::zero());
  }
}

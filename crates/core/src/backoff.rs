use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential backoff: `base * 2^(attempt-1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max: max.max(base) } }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self { Self::new(Duration::from_millis(100), Duration::from_secs(30)) }
}

/// Parse an environment variable, ignoring unset or malformed values.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(70));
        let got: Vec<u128> = (1..=6).map(|a| b.delay(a).as_millis()).collect();
        assert_eq!(got, vec![10, 20, 40, 70, 70, 70]);
        // very large attempt counts stay capped
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(70));
    }

    #[test]
    fn max_never_below_base() {
        let b = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
    }
}

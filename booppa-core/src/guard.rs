//! Re-processing guard
//!
//! Bounds how often an incomplete report can be re-triggered: a hard ceiling
//! on total attempts and a minimum cool-down since the previous attempt. The
//! store applies the decision and the attempt bookkeeping in one atomic update
//! (`ReportStore::record_trigger`).

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::ThrottleReason;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessGuard {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Default for ReprocessGuard {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl ReprocessGuard {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
        }
    }

    /// Decide whether attempt number `attempts + 1` may start at `now`.
    pub fn evaluate(
        &self,
        attempts: u32,
        last_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ThrottleReason> {
        if attempts >= self.max_attempts {
            return Err(ThrottleReason::AttemptsExhausted {
                attempts,
                max: self.max_attempts,
            });
        }

        if let Some(last) = last_attempt_at {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.cooldown {
                return Err(ThrottleReason::CoolingDown {
                    retry_after: self.cooldown - elapsed,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_first_attempt_allowed() {
        let guard = ReprocessGuard::default();
        assert!(guard.evaluate(0, None, Utc::now()).is_ok());
    }

    #[test]
    fn test_fourth_attempt_rejected() {
        let guard = ReprocessGuard::default();
        let now = Utc::now();
        let long_ago = now - ChronoDuration::hours(5);

        assert!(guard.evaluate(2, Some(long_ago), now).is_ok());
        assert_eq!(
            guard.evaluate(3, Some(long_ago), now),
            Err(ThrottleReason::AttemptsExhausted {
                attempts: 3,
                max: 3
            })
        );
    }

    #[test]
    fn test_attempt_within_cooldown_rejected() {
        let guard = ReprocessGuard::default();
        let now = Utc::now();

        let result = guard.evaluate(1, Some(now - ChronoDuration::seconds(599)), now);
        assert_eq!(
            result,
            Err(ThrottleReason::CoolingDown {
                retry_after: Duration::from_secs(1)
            })
        );

        assert!(guard
            .evaluate(1, Some(now - ChronoDuration::seconds(600)), now)
            .is_ok());
    }

    #[test]
    fn test_clock_skew_counts_as_no_time_elapsed() {
        let guard = ReprocessGuard::default();
        let now = Utc::now();
        let future = now + ChronoDuration::seconds(30);
        assert!(matches!(
            guard.evaluate(1, Some(future), now),
            Err(ThrottleReason::CoolingDown { retry_after }) if retry_after == DEFAULT_COOLDOWN
        ));
    }
}

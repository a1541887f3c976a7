//! Fixed-window counter implementation.

use chrono::{DateTime, TimeDelta, Utc};

use super::policy::Policy;

/// Outcome of evaluating one or more policies for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call is within quota
    Allow,
    /// The call is over quota until `reset_at`
    Deny { reset_at: DateTime<Utc> },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Wire form: `None` for allow, unix milliseconds of the reset for deny.
    pub fn reset_millis(&self) -> Option<i64> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reset_at } => Some(reset_at.timestamp_millis()),
        }
    }
}

/// Call count for one identity inside one policy window.
///
/// `expiration` is always the window start plus the policy interval. The
/// call that overflows the limit is still counted, so a stream of denied
/// calls cannot restart the window early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u64,
    pub expiration: DateTime<Utc>,
}

impl WindowCounter {
    /// A counter for the first call seen in a new window.
    pub fn first_hit(policy: &Policy, now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            expiration: window_end(policy, now),
        }
    }

    /// Record one call and decide it.
    pub fn hit(&mut self, policy: &Policy, now: DateTime<Utc>) -> Decision {
        if now >= self.expiration {
            self.count = 0;
            self.expiration = window_end(policy, now);
        }

        self.count = self.count.saturating_add(1);
        if self.count > policy.limit {
            Decision::Deny {
                reset_at: self.expiration,
            }
        } else {
            Decision::Allow
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

fn window_end(policy: &Policy, now: DateTime<Utc>) -> DateTime<Utc> {
    let interval = i64::try_from(policy.interval).unwrap_or(i64::MAX);
    let span = TimeDelta::try_seconds(interval).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(limit: u64, interval: u64) -> Policy {
        Policy::new("test", limit, interval).unwrap()
    }

    #[test]
    fn test_first_hit_opens_window() {
        let now = Utc::now();
        let counter = WindowCounter::first_hit(&policy(5, 60), now);

        assert_eq!(counter.count, 1);
        assert_eq!(counter.expiration, now + TimeDelta::seconds(60));
        assert!(!counter.is_expired(now));
    }

    #[test]
    fn test_hit_denies_past_limit_and_keeps_count() {
        let now = Utc::now();
        let p = policy(2, 60);
        let mut counter = WindowCounter::first_hit(&p, now);

        assert_eq!(counter.hit(&p, now), Decision::Allow);
        let denied = counter.hit(&p, now);
        assert_eq!(
            denied,
            Decision::Deny {
                reset_at: counter.expiration
            }
        );
        assert_eq!(counter.count, 3);

        // Still denied, window unchanged.
        let expiration = counter.expiration;
        assert!(!counter.hit(&p, now + TimeDelta::seconds(30)).is_allowed());
        assert_eq!(counter.expiration, expiration);
        assert_eq!(counter.count, 4);
    }

    #[test]
    fn test_hit_after_expiration_starts_fresh_window() {
        let now = Utc::now();
        let p = policy(1, 10);
        let mut counter = WindowCounter::first_hit(&p, now);
        assert!(!counter.hit(&p, now).is_allowed());

        let later = now + TimeDelta::seconds(10);
        assert!(counter.is_expired(later));
        assert_eq!(counter.hit(&p, later), Decision::Allow);
        assert_eq!(counter.count, 1);
        assert_eq!(counter.expiration, later + TimeDelta::seconds(10));
    }

    #[test]
    fn test_reset_millis() {
        let now = Utc::now();
        assert_eq!(Decision::Allow.reset_millis(), None);
        assert_eq!(
            Decision::Deny { reset_at: now }.reset_millis(),
            Some(now.timestamp_millis())
        );
    }
}

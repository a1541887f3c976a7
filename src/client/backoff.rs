//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::ClientConfig;

/// Upper bound of the random spread added to each delay, as a fraction.
const JITTER: f64 = 0.2;

/// Delays between reconnect attempts.
///
/// The delay starts at `min`, doubles per attempt up to `max`, and picks up a
/// little jitter so a fleet of clients does not reconnect in lockstep. Every
/// delay stays within `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            max_attempts,
            attempt: 0,
            next: min,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnect_min(),
            config.reconnect_max(),
            config.reconnect_attempts(),
        )
    }

    /// Attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the attempts ran out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempt >= max_attempts {
                return None;
            }
        }

        let base = self.next;
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER);
        let delay = base.mul_f64(1.0 + jitter).min(self.max);

        self.attempt += 1;
        self.next = base.saturating_mul(2).min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_within_bounds() {
        let min = Duration::from_secs(10);
        let max = Duration::from_secs(30);
        let mut backoff = Backoff::new(min, max, None);

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay().unwrap()).collect();
        for delay in &delays {
            assert!(*delay >= min && *delay <= max, "{:?} out of bounds", delay);
        }
        // First delay is near the floor, late ones sit at the ceiling.
        assert!(delays[0] <= Duration::from_secs(12));
        assert_eq!(delays[5], max);
    }

    #[test]
    fn test_attempts_run_out() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), Some(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_from_config_defaults() {
        let mut backoff = Backoff::from_config(&ClientConfig::default());
        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_secs(10) && first <= Duration::from_secs(12));
        for _ in 1..10 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(backoff.next_delay().is_none());
    }
}

//! Restart timing for replacement workers.
//!
//! A policy only decides *when* a replacement is spawned, never *whether*:
//! every exit is healed.

use std::time::Duration;

/// Exponential backoff schedule.
///
/// ```
/// use forkpool::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::exponential()
///     .with_initial_interval(Duration::from_millis(100))
///     .with_max_interval(Duration::from_secs(5));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Upper bound for any single delay.
    pub max_interval: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl BackoffPolicy {
    /// 100ms initial, doubling, capped at 30s.
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// When to spawn the replacement for an exited worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RestartPolicy {
    /// Replace at once, no matter how often workers die.
    #[default]
    Immediate,
    /// Back off while workers keep dying shortly after spawn.
    ExponentialBackoff(BackoffPolicy),
    /// Replace at once until `max_rapid_exits` rapid exits in a row, then
    /// wait `cooldown` before each further replacement.
    CircuitBreaker {
        max_rapid_exits: u32,
        cooldown: Duration,
    },
}

impl RestartPolicy {
    /// Delay for the next replacement given the current run of rapid exits.
    pub fn delay(&self, consecutive_rapid_exits: u32) -> Duration {
        match self {
            RestartPolicy::Immediate => Duration::ZERO,
            RestartPolicy::ExponentialBackoff(backoff) => {
                if consecutive_rapid_exits == 0 {
                    Duration::ZERO
                } else {
                    backoff.delay_for_attempt(consecutive_rapid_exits)
                }
            }
            RestartPolicy::CircuitBreaker {
                max_rapid_exits,
                cooldown,
            } => {
                if consecutive_rapid_exits >= *max_rapid_exits {
                    *cooldown
                } else {
                    Duration::ZERO
                }
            }
        }
    }
}

/// Counts consecutive rapid exits across the pool.
///
/// An exit is rapid when the worker lived shorter than the threshold, which
/// is what a bind-failure storm looks like.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    rapid_exit_threshold: Duration,
    consecutive_rapid_exits: u32,
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RestartTracker {
    pub fn new(rapid_exit_threshold: Duration) -> Self {
        Self {
            rapid_exit_threshold,
            consecutive_rapid_exits: 0,
        }
    }

    /// Record one exit and return the updated run length.
    pub fn record_exit(&mut self, uptime: Duration) -> u32 {
        if uptime < self.rapid_exit_threshold {
            self.consecutive_rapid_exits = self.consecutive_rapid_exits.saturating_add(1);
        } else {
            self.consecutive_rapid_exits = 0;
        }
        self.consecutive_rapid_exits
    }

    pub fn consecutive_rapid_exits(&self) -> u32 {
        self.consecutive_rapid_exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = BackoffPolicy::exponential()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(50));
    }

    #[test]
    fn immediate_ignores_exit_history() {
        assert_eq!(RestartPolicy::Immediate.delay(0), Duration::ZERO);
        assert_eq!(RestartPolicy::Immediate.delay(1_000), Duration::ZERO);
    }

    #[test]
    fn backoff_policy_only_delays_rapid_exits() {
        let policy = RestartPolicy::ExponentialBackoff(BackoffPolicy::fixed(
            Duration::from_millis(250),
        ));
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(250));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let policy = RestartPolicy::CircuitBreaker {
            max_rapid_exits: 3,
            cooldown: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(2), Duration::ZERO);
        assert_eq!(policy.delay(3), Duration::from_secs(10));
        assert_eq!(policy.delay(9), Duration::from_secs(10));
    }

    #[test]
    fn tracker_resets_after_healthy_run() {
        let mut tracker = RestartTracker::new(Duration::from_secs(1));
        assert_eq!(tracker.record_exit(Duration::from_millis(10)), 1);
        assert_eq!(tracker.record_exit(Duration::from_millis(10)), 2);
        assert_eq!(tracker.record_exit(Duration::from_secs(60)), 0);
        assert_eq!(tracker.consecutive_rapid_exits(), 0);
    }
}

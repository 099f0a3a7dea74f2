//! Retry strategy for transient remote failures
//!
//! Thin configuration layer over the `backon` crate. The watcher's long-poll
//! loop keeps pulling delays from the iterator until the call succeeds or the
//! component is stopped.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Exponential backoff configuration
///
/// The default matches the watcher's retry behavior: 1s initial delay doubling
/// up to a 10s cap, with no bound on the number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub min_delay: Duration,
    /// Cap applied to the growing delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f32,
    /// Maximum number of retries; `None` retries forever
    pub max_times: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_times: None,
        }
    }
}

impl RetryPolicy {
    /// Build the delay sequence for one retried operation
    ///
    /// Each retried operation gets its own iterator so the delay growth resets
    /// after a success.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor);
        let builder = match self.max_times {
            Some(times) => builder.with_max_times(times),
            None => builder.without_max_times(),
        };
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = policy.delays().take(6).collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        // Capped from here on
        assert_eq!(delays[4], Duration::from_secs(10));
        assert_eq!(delays[5], Duration::from_secs(10));
    }

    #[test]
    fn test_unbounded_policy_keeps_yielding() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delays().take(1000).count(), 1000);
    }

    #[test]
    fn test_bounded_policy_stops() {
        let policy = RetryPolicy {
            max_times: Some(3),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delays().count(), 3);
    }
}

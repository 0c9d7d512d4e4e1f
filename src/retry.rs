//! Rejoin policies for the subscriber loop.
//!
//! After a transient consumption failure the subscriber rejoins its group.
//! Two policies are available:
//!
//! | Policy | Delay | Limit | Use Case |
//! |--------|-------|-------|----------|
//! | [`RejoinPolicy::Unbounded`] | none | none | demonstration default |
//! | [`RejoinPolicy::Backoff`] | exponential, jittered | `max_retries` | hardened runs |
//!
//! `Unbounded` rejoins immediately and forever. Under sustained broker
//! unavailability this spins against the broker without end; it is kept as
//! the default because the harness is expected to run against a healthy
//! local broker. Prefer [`hardened_policy`] anywhere else.
//!
//! The backoff schedule is built with `backon`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use kafka_exchange::retry::{RejoinPolicy, hardened_policy};
//!
//! let mut schedule = hardened_policy(3).schedule();
//! assert!(schedule.next_delay().is_some());
//! assert!(schedule.next_delay().is_some());
//! assert!(schedule.next_delay().is_some());
//! assert!(schedule.next_delay().is_none());
//!
//! let mut forever = RejoinPolicy::Unbounded.schedule();
//! assert_eq!(forever.next_delay(), Some(Duration::ZERO));
//! ```

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::constants::{DEFAULT_REJOIN_MAX_DELAY, DEFAULT_REJOIN_MIN_DELAY};

/// How the subscriber loop paces and limits rejoin attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejoinPolicy {
    /// Rejoin immediately, with no retry limit.
    #[default]
    Unbounded,

    /// Exponential backoff between attempts, giving up after `max_retries`
    /// consecutive failures.
    Backoff {
        min_delay: Duration,
        max_delay: Duration,
        max_retries: u32,
        jitter: bool,
    },
}

impl RejoinPolicy {
    /// Starts a fresh schedule. The subscriber loop builds a new one after
    /// every successful join.
    pub fn schedule(&self) -> RejoinSchedule {
        let backoff = match *self {
            RejoinPolicy::Unbounded => None,
            RejoinPolicy::Backoff {
                min_delay,
                max_delay,
                max_retries,
                jitter,
            } => {
                let mut builder = ExponentialBuilder::default()
                    .with_min_delay(min_delay)
                    .with_max_delay(max_delay)
                    .with_max_times(max_retries as usize);
                if jitter {
                    builder = builder.with_jitter();
                }
                Some(builder.build())
            }
        };
        RejoinSchedule {
            backoff,
            attempts: 0,
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, RejoinPolicy::Backoff { .. })
    }
}

/// Policy for runs that must not retry forever.
///
/// Characteristics:
/// - Initial delay 100ms, capped at 5s
/// - Jitter enabled
/// - Gives up after `max_retries` consecutive failed sessions
pub fn hardened_policy(max_retries: u32) -> RejoinPolicy {
    RejoinPolicy::Backoff {
        min_delay: DEFAULT_REJOIN_MIN_DELAY,
        max_delay: DEFAULT_REJOIN_MAX_DELAY,
        max_retries,
        jitter: true,
    }
}

/// Delay sequence for consecutive rejoin attempts.
pub struct RejoinSchedule {
    backoff: Option<ExponentialBackoff>,
    attempts: u32,
}

impl std::fmt::Debug for RejoinSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejoinSchedule")
            .field("bounded", &self.backoff.is_some())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl RejoinSchedule {
    /// Returns the delay before the next attempt, or `None` once the policy
    /// is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = match self.backoff.as_mut() {
            None => Some(Duration::ZERO),
            Some(backoff) => backoff.next(),
        };
        if delay.is_some() {
            self.attempts = self.attempts.saturating_add(1);
        }
        delay
    }

    /// Rejoin attempts granted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_retries: u32) -> RejoinPolicy {
        RejoinPolicy::Backoff {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_retries,
            jitter: false,
        }
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let mut schedule = RejoinPolicy::Unbounded.schedule();
        for _ in 0..1000 {
            assert_eq!(schedule.next_delay(), Some(Duration::ZERO));
        }
        assert_eq!(schedule.attempts(), 1000);
    }

    #[test]
    fn test_backoff_exhausts_after_max_retries() {
        let mut schedule = fixed(3).schedule();
        let delays: Vec<_> = std::iter::from_fn(|| schedule.next_delay()).collect();
        assert_eq!(delays.len(), 3);
        assert_eq!(schedule.attempts(), 3);
        assert!(schedule.next_delay().is_none());
    }

    #[test]
    fn test_backoff_starts_at_min_and_respects_cap() {
        let mut schedule = fixed(6).schedule();
        let first = schedule.next_delay().unwrap();
        assert_eq!(first, Duration::from_millis(10));
        while let Some(delay) = schedule.next_delay() {
            assert!(delay <= Duration::from_millis(40), "delay {delay:?} over cap");
        }
    }

    #[test]
    fn test_new_schedule_resets_attempts() {
        let policy = fixed(1);
        let mut a = policy.schedule();
        assert!(a.next_delay().is_some());
        assert!(a.next_delay().is_none());

        let mut b = policy.schedule();
        assert!(b.next_delay().is_some());
    }

    #[test]
    fn test_zero_retries_exhausts_immediately() {
        let mut schedule = fixed(0).schedule();
        assert!(schedule.next_delay().is_none());
        assert_eq!(schedule.attempts(), 0);
    }

    #[test]
    fn test_hardened_policy_is_bounded() {
        assert!(hardened_policy(5).is_bounded());
        assert!(!RejoinPolicy::default().is_bounded());
    }
}

//! # Retry Policy
//! Pure mapping from `(ErrorClass, attempt_count)` to a queue action, plus
//! the exponential-backoff delay computation. No I/O here, so the whole
//! policy is unit-testable without a runtime.

use std::time::Duration;

use rand::Rng;

use crate::types::{Classification, ErrorClass};

/// What the dispatcher should do with a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// Re-queue with the given delay.
    Retry { delay: Duration },
    /// Stop retrying; the task is reported as a terminal failure.
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Randomize delays by `rand(0.5, 1.5)`. Off in deterministic tests.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff with jitter: `base * 2^attempt * rand(0.5, 1.5)`, capped.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let jitter: f64 = if self.jitter {
            rand::rng().random_range(0.5..1.5)
        } else {
            1.0
        };
        self.delay_with_jitter(attempt_count, jitter)
    }

    /// Same computation with the jitter factor supplied by the caller.
    /// Tests pin the factor; `delay_for` draws it.
    pub fn delay_with_jitter(&self, attempt_count: u32, jitter: f64) -> Duration {
        // 2^attempt saturates well before the cap bites.
        let exp = 2f64.powi(attempt_count.min(32) as i32);
        let secs = self.base.as_secs_f64() * exp * jitter;
        Duration::from_secs_f64(secs).min(self.cap)
    }

    /// Expected (jitter-free) delay, for monotonicity checks and logging.
    pub fn expected_delay(&self, attempt_count: u32) -> Duration {
        self.delay_with_jitter(attempt_count, 1.0)
    }
}

/// The single authoritative mapping from adapter-reported error conditions
/// to retryable/terminal. Adapters surface a raw `ErrorClass` only.
pub fn classify(err: &ErrorClass) -> Classification {
    match err {
        ErrorClass::Timeout
        | ErrorClass::Blocked
        | ErrorClass::RateLimited { .. }
        | ErrorClass::ServerError => Classification::RetryableFailure,
        ErrorClass::NotFound | ErrorClass::ParseUnavailable => Classification::TerminalFailure,
    }
}

/// Decide the queue action for a failed attempt. `attempt_count` is the
/// number of attempts already consumed (the one that just failed included).
pub fn action_for(policy: &RetryPolicy, err: &ErrorClass, attempt_count: u32) -> QueueAction {
    match classify(err) {
        Classification::TerminalFailure => QueueAction::GiveUp,
        _ if attempt_count >= policy.max_attempts => QueueAction::GiveUp,
        _ => {
            let mut delay = policy.delay_for(attempt_count);
            // Honor an upstream Retry-After hint when it asks for more
            // patience than our own backoff.
            if let ErrorClass::RateLimited {
                retry_after: Some(hint),
            } = err
            {
                delay = delay.max(*hint).min(policy.cap);
            }
            QueueAction::Retry { delay }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(classify(&ErrorClass::Timeout), Classification::RetryableFailure);
        assert_eq!(classify(&ErrorClass::Blocked), Classification::RetryableFailure);
        assert_eq!(
            classify(&ErrorClass::RateLimited { retry_after: None }),
            Classification::RetryableFailure
        );
        assert_eq!(classify(&ErrorClass::ServerError), Classification::RetryableFailure);
        assert_eq!(classify(&ErrorClass::NotFound), Classification::TerminalFailure);
        assert_eq!(
            classify(&ErrorClass::ParseUnavailable),
            Classification::TerminalFailure
        );
    }

    #[test]
    fn expected_delay_doubles_until_cap() {
        let p = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
            jitter: false,
        };
        assert_eq!(p.expected_delay(0), Duration::from_secs(1));
        assert_eq!(p.expected_delay(1), Duration::from_secs(2));
        assert_eq!(p.expected_delay(2), Duration::from_secs(4));
        assert_eq!(p.expected_delay(10), Duration::from_secs(60)); // capped
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::default();
        for attempt in 0..6 {
            let d = p.delay_for(attempt);
            let lo = p.delay_with_jitter(attempt, 0.5);
            let hi = p.delay_with_jitter(attempt, 1.5);
            assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in [{lo:?}, {hi:?}]");
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let p = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let err = ErrorClass::ServerError;
        assert!(matches!(action_for(&p, &err, 1), QueueAction::Retry { .. }));
        assert!(matches!(action_for(&p, &err, 2), QueueAction::Retry { .. }));
        assert_eq!(action_for(&p, &err, 3), QueueAction::GiveUp);
    }

    #[test]
    fn retry_after_hint_raises_delay() {
        let p = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(600),
            max_attempts: 5,
            jitter: true,
        };
        let err = ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        };
        match action_for(&p, &err, 1) {
            QueueAction::Retry { delay } => assert!(delay >= Duration::from_secs(90)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn terminal_errors_never_retry() {
        let p = RetryPolicy::default();
        assert_eq!(action_for(&p, &ErrorClass::NotFound, 0), QueueAction::GiveUp);
        assert_eq!(
            action_for(&p, &ErrorClass::ParseUnavailable, 0),
            QueueAction::GiveUp
        );
    }
}

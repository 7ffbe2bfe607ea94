//! Retry logic with exponential backoff for transient remote failures.
//!
//! A failed wire attempt is classified into a [`FailureType`]; the
//! [`RetryPolicy`] then decides whether to try again and how long to wait.
//!
//! # Example
//!
//! ```
//! use chemfetch_core::transport::{
//!     FailureType, RetryDecision, RetryPolicy, WireFailure, classify_failure,
//! };
//!
//! let policy = RetryPolicy::default();
//! let failure_type = classify_failure(&WireFailure::status(503));
//! assert_eq!(failure_type, FailureType::Transient);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => println!("not retrying: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::WireFailure;

/// Default maximum attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap, before jitter.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default upper bound of the uniform jitter.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry: timeouts, 5xx, connection resets.
    Transient,

    /// Will not succeed on retry: 400, 403, TLS failures, bad payloads.
    Permanent,

    /// Server rate limiting (HTTP 429). Retried with backoff or Retry-After.
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The upcoming attempt number (1-indexed, so the first retry is 2).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Why the policy stopped.
        reason: StopReason,
    },
}

/// Why a [`RetryPolicy`] stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The failure cannot succeed on retry.
    Permanent,
    /// The attempt cap was reached.
    Exhausted {
        /// The cap that was reached.
        max_attempts: u32,
    },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permanent => f.write_str("permanent failure - retry would not help"),
            Self::Exhausted { max_attempts } => write!(f, "max attempts ({max_attempts}) exhausted"),
        }
    }
}

impl RetryDecision {
    /// True when the policy gave up because the attempt cap was reached.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::DoNotRetry {
                reason: StopReason::Exhausted { .. }
            }
        )
    }
}

/// Retry behaviour with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults the waits are roughly 1s, 2s, 4s, 8s plus up to 1s jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// `max_attempts` is clamped to at least one.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter,
        }
    }

    /// Creates a policy with a custom attempt cap and default timings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns this policy with jitter disabled.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Maximum attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after attempt number `attempt` failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: StopReason::Permanent,
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: StopReason::Exhausted {
                    max_attempts: self.max_attempts,
                },
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff for the wait after attempt `attempt`, without jitter.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a failed attempt for retry decisions.
///
/// | Failure | Type |
/// |---------|------|
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429 | RateLimited |
/// | other HTTP 4xx | Permanent |
/// | Timeout | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | Decode | Permanent |
#[must_use]
pub fn classify_failure(failure: &WireFailure) -> FailureType {
    match failure {
        WireFailure::Status { status, .. } => classify_http_status(*status),
        WireFailure::Timeout => FailureType::Transient,
        WireFailure::Network { tls, .. } => {
            if *tls {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        WireFailure::Decode { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 => FailureType::Permanent, // Bad Request, unparseable identifier
        401 => FailureType::Permanent, // Unauthorized
        403 => FailureType::Permanent, // Forbidden
        408 => FailureType::Transient, // Request Timeout
        410 => FailureType::Permanent, // Gone
        429 => FailureType::RateLimited,
        500 => FailureType::Transient,
        502 => FailureType::Transient,
        503 => FailureType::Transient, // PUG-REST "server busy"
        504 => FailureType::Transient, // PUG-REST request timeout
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(16));
        assert_eq!(policy.max_jitter, Duration::from_secs(1));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(9), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let RetryDecision::Retry { delay, attempt } =
                policy.should_retry(FailureType::Transient, 2)
            else {
                panic!("expected retry");
            };
            assert_eq!(attempt, 3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(
            policy.should_retry(FailureType::RateLimited, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(1),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_permanent_never_retried() {
        let decision = RetryPolicy::default().should_retry(FailureType::Permanent, 1);
        assert_eq!(
            decision,
            RetryDecision::DoNotRetry {
                reason: StopReason::Permanent
            }
        );
        assert!(!decision.is_exhausted());
    }

    #[test]
    fn test_exhausted_at_cap() {
        let decision = RetryPolicy::with_max_attempts(3).should_retry(FailureType::Transient, 3);
        assert!(decision.is_exhausted());
        assert_eq!(
            decision,
            RetryDecision::DoNotRetry {
                reason: StopReason::Exhausted { max_attempts: 3 }
            }
        );
        assert_eq!(
            StopReason::Exhausted { max_attempts: 3 }.to_string(),
            "max attempts (3) exhausted"
        );
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(classify_failure(&WireFailure::status(503)), FailureType::Transient);
        assert_eq!(classify_failure(&WireFailure::status(504)), FailureType::Transient);
        assert_eq!(classify_failure(&WireFailure::status(408)), FailureType::Transient);
        assert_eq!(classify_failure(&WireFailure::status(429)), FailureType::RateLimited);
        assert_eq!(classify_failure(&WireFailure::status(400)), FailureType::Permanent);
        assert_eq!(classify_failure(&WireFailure::status(403)), FailureType::Permanent);
        assert_eq!(classify_failure(&WireFailure::status(418)), FailureType::Permanent);
        assert_eq!(classify_failure(&WireFailure::status(599)), FailureType::Transient);
    }

    #[test]
    fn test_classify_non_status_failures() {
        assert_eq!(classify_failure(&WireFailure::Timeout), FailureType::Transient);
        assert_eq!(
            classify_failure(&WireFailure::network("connection reset by peer")),
            FailureType::Transient
        );
        assert_eq!(
            classify_failure(&WireFailure::network("TLS handshake failed")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_failure(&WireFailure::decode("expected value")),
            FailureType::Permanent
        );
    }
}

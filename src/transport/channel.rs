//! Rate-limited, retrying request channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{
    Endpoints, FailureType, RateLimiter, RemoteReply, Request, RetryDecision, RetryPolicy,
    Transport, TransportError, WireFailure, classify_failure, parse_retry_after,
};
use crate::clock::Clock;

/// Counters for wire activity through one channel.
///
/// Atomic so concurrent chunk and lookup tasks can update them.
#[derive(Debug, Default)]
pub struct ChannelStats {
    attempts: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
}

impl ChannelStats {
    /// Wire attempts made, retries and pages included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Attempts that were retries.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Requests that ended in a [`TransportError`].
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

/// The one path from the engine to the remote service.
///
/// Every wire attempt first passes the shared [`RateLimiter`]; transient
/// failures are retried per the [`RetryPolicy`], sleeping on the injected
/// [`Clock`].
#[derive(Debug)]
pub struct Channel {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    endpoints: Endpoints,
    stats: ChannelStats,
}

impl Channel {
    /// Creates a channel.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            clock,
            endpoints,
            stats: ChannelStats::default(),
        }
    }

    /// Wire counters.
    #[must_use]
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// The shared limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Remote base URLs.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Sends `request`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when a permanent failure occurs or the
    /// retry cap is reached.
    #[instrument(skip(self, request), fields(request = request.label()))]
    pub async fn send(&self, request: &Request) -> Result<RemoteReply, TransportError> {
        let url = self.endpoints.url(request);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.acquire().await;
            self.stats.attempts.fetch_add(1, Ordering::SeqCst);
            debug!(%url, attempt, "sending request");

            let failure = match self.transport.execute(&url).await {
                Ok(reply) => return Ok(reply),
                Err(failure) => failure,
            };

            let failure_type = classify_failure(&failure);
            let retry_after = self.server_delay(&failure, failure_type).await;

            match self.policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff,
                    attempt: next_attempt,
                } => {
                    let delay = retry_after.unwrap_or(backoff);
                    info!(
                        %url,
                        attempt = next_attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        error = %failure,
                        "retrying request"
                    );
                    self.stats.retried.fetch_add(1, Ordering::SeqCst);
                    self.clock.sleep(delay).await;
                }
                decision @ RetryDecision::DoNotRetry { .. } => {
                    let exhausted = decision.is_exhausted();
                    if exhausted {
                        warn!(%url, attempts = attempt, error = %failure, "retries exhausted");
                    } else if let RetryDecision::DoNotRetry { reason } = &decision {
                        debug!(%url, %reason, "not retrying request");
                    }
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                    return Err(TransportError::from_wire(&url, &failure, attempt, exhausted));
                }
            }
        }
    }

    /// Honours a Retry-After header on 429/503, recording it in the limiter.
    async fn server_delay(
        &self,
        failure: &WireFailure,
        failure_type: FailureType,
    ) -> Option<Duration> {
        let WireFailure::Status {
            status,
            retry_after: Some(value),
        } = failure
        else {
            return None;
        };
        if failure_type == FailureType::Permanent || !matches!(status, 429 | 503) {
            return None;
        }
        let delay = parse_retry_after(value)?;
        self.limiter.record_rate_limit(delay).await;
        Some(delay)
    }
}

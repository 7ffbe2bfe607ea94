//! Request-rate limiting for the shared remote channel.
//!
//! [`RateLimiter`] admits at most `max_requests` wire attempts in any trailing
//! `window`. Every attempt, retries and pagination pages included, must call
//! [`RateLimiter::acquire`] first.
//!
//! The window state lives behind one `tokio::sync::Mutex`. The lock is only
//! held to inspect and update the timestamps; a caller that must wait
//! releases it, sleeps on the injected [`Clock`], then re-checks.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chemfetch_core::clock::TokioClock;
//! use chemfetch_core::transport::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(5, Duration::from_secs(1), Arc::new(TokioClock));
//! for _ in 0..6 {
//!     // the sixth call waits until the first leaves the window
//!     limiter.acquire().await;
//! }
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;

/// Warning threshold for cumulative delay.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value honoured.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default ceiling: PubChem allows five requests per second.
pub const DEFAULT_MAX_REQUESTS: u32 = 5;

/// Default trailing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window limiter shared by every caller of one channel.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    disabled: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
    cumulative_delay_ms: AtomicU64,
    admitted: AtomicU64,
}

#[derive(Debug, Default)]
struct WindowState {
    /// Admission instants still inside the window, oldest first.
    recent: VecDeque<Instant>,
    /// Server-mandated pause from a Retry-After header.
    blocked_until: Option<Instant>,
}

impl WindowState {
    /// Either admits a request at `now` or returns how long to wait.
    fn try_admit(&mut self, now: Instant, max_requests: u32, window: Duration) -> Option<Duration> {
        if let Some(until) = self.blocked_until {
            if until > now {
                return Some(until - now);
            }
            self.blocked_until = None;
        }

        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        if self.recent.len() < max_requests as usize {
            self.recent.push_back(now);
            return None;
        }

        // The oldest admission must leave the window first.
        self.recent
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per trailing `window`.
    ///
    /// A ceiling of zero yields a disabled limiter.
    #[must_use]
    #[instrument(skip(clock), fields(window_ms = window.as_millis()))]
    pub fn new(max_requests: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        if max_requests == 0 {
            return Self::disabled(clock);
        }
        debug!("creating rate limiter");
        Self {
            max_requests,
            window,
            disabled: false,
            clock,
            state: Mutex::new(WindowState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        }
    }

    /// Creates a limiter that admits everything immediately.
    #[must_use]
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        debug!("creating disabled rate limiter");
        Self {
            max_requests: 0,
            window: Duration::ZERO,
            disabled: true,
            clock,
            state: Mutex::new(WindowState::default()),
            cumulative_delay_ms: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        }
    }

    /// Returns whether limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Maximum admissions per window.
    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Length of the trailing window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Total admissions so far.
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total time callers have spent waiting in this limiter.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Waits until one more request fits in the window, then records it.
    #[instrument(skip(self))]
    pub async fn acquire(&self) {
        if self.disabled {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.try_admit(self.clock.now(), self.max_requests, self.window)
            };

            let Some(delay) = wait else {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                return;
            };

            let cumulative = self.add_cumulative_delay(delay);
            debug!(
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider smaller batches"
                );
            }

            self.clock.sleep(delay).await;
        }
    }

    /// Records a server-mandated pause (from a Retry-After header).
    ///
    /// No request is admitted before `now + delay`. A shorter pause never
    /// shortens one already in force.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis()))]
    pub async fn record_rate_limit(&self, delay: Duration) {
        if self.disabled {
            return;
        }
        let until = self.clock.now() + delay;
        let mut state = self.state.lock().await;
        state.blocked_until = Some(state.blocked_until.map_or(until, |current| current.max(until)));
        debug!("recorded server rate limit");
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-dates. Returns `None` when the value
/// cannot be parsed; caps values at one hour.
///
/// ```
/// use std::time::Duration;
/// use chemfetch_core::transport::parse_retry_after;
///
/// assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => {
            warn!(
                delay_secs = duration.as_secs(),
                "Retry-After date exceeds maximum, capping at 1 hour"
            );
            Some(MAX_RETRY_AFTER)
        }
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(max, Duration::from_secs(1), clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_requests_under_ceiling_are_immediate() {
        let (clock, limiter) = limiter(5);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(limiter.admitted(), 5);
    }

    #[tokio::test]
    async fn test_request_over_ceiling_waits_for_window() {
        let (clock, limiter) = limiter(5);
        for _ in 0..6 {
            limiter.acquire().await;
        }
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_window_slides_with_spaced_requests() {
        let (clock, limiter) = limiter(2);
        limiter.acquire().await;
        clock.advance(Duration::from_millis(600));
        limiter.acquire().await;
        // Oldest admission leaves the window 400ms from now.
        limiter.acquire().await;
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(400)]);
    }

    #[tokio::test]
    async fn test_trailing_window_never_exceeds_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(1), clock.clone()));
        let mut stamps = Vec::new();
        for _ in 0..23 {
            limiter.acquire().await;
            stamps.push(clock.now());
        }
        for (i, stamp) in stamps.iter().enumerate() {
            let in_window = stamps[..=i]
                .iter()
                .filter(|earlier| stamp.duration_since(**earlier) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 5, "window ending at #{i} holds {in_window}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_acquires_respect_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(1), clock.clone()));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = Arc::clone(&limiter);
            let clock = Arc::clone(&clock);
            let stamps = Arc::clone(&stamps);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                stamps.lock().unwrap().push(clock.now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.admitted(), 9);
        assert!(clock.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_disabled_never_waits() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(0, Duration::from_secs(1), clock.clone());
        assert!(limiter.is_disabled());
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(limiter.admitted(), 50);
    }

    #[tokio::test]
    async fn test_recorded_rate_limit_blocks_next_acquire() {
        let (clock, limiter) = limiter(5);
        limiter.record_rate_limit(Duration::from_secs(3)).await;
        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_shorter_rate_limit_does_not_shorten_pause() {
        let (clock, limiter) = limiter(5);
        limiter.record_rate_limit(Duration::from_secs(4)).await;
        limiter.record_rate_limit(Duration::from_secs(1)).await;
        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cumulative_delay_tracked() {
        let (_clock, limiter) = limiter(1);
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.cumulative_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative_and_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("later"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}

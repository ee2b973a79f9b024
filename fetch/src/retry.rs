//! Retry policy and attempt bookkeeping.
//!
//! # Policy
//!
//! - Max retries: 3 (4 total attempts)
//! - Delay before attempt `k` (k >= 1): `retry_delay * 2^(k-1)`
//! - Optional cap (`max_delay`) and down-jitter (`jitter_factor`, off by default)
//! - `Retry-After-Ms` / `Retry-After` replace the computed delay when in (0, 60s)
//!
//! # Retryable conditions
//!
//! - HTTP 408, 429, 5xx
//! - Timeouts and transport errors
//!
//! # Headers
//!
//! - `X-Keystone-Retry-Count`: 0 for the initial request, 1+ for retries
//! - `Idempotency-Key`: `keystone-{uuid}`, same across all attempts (non-GET only)

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use uuid::Uuid;

use keystone_config::FetchConfig;
use keystone_types::RetryContext;

pub const RETRY_COUNT_HEADER: &str = "x-keystone-retry-count";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff, doubled per attempt.
    pub retry_delay: Duration,
    /// When false, nothing is retried.
    pub retry_on_transient_error: bool,
    pub max_delay: Option<Duration>,
    /// Down-jitter fraction: the delay is multiplied by a factor in
    /// `[1 - jitter_factor, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: FetchConfig::DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(FetchConfig::DEFAULT_RETRY_DELAY_MS),
            retry_on_transient_error: true,
            max_delay: None,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            retry_delay: config.retry_delay(),
            retry_on_transient_error: config.retry_on_transient_error,
            max_delay: config.max_delay(),
            jitter_factor: config.jitter_factor(),
        }
    }

    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff after the failed attempt `attempt` (zero-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let base = self.retry_delay.saturating_mul(factor);
        let capped = self.max_delay.map_or(base, |cap| base.min(cap));

        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        if jitter_factor > 0.0 {
            let jitter = 1.0 - rand::random::<f64>() * jitter_factor;
            capped.mul_f64(jitter)
        } else {
            capped
        }
    }

    /// The server's hint wins over the computed backoff.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        hint.unwrap_or_else(|| self.backoff_delay(attempt))
    }
}

/// Parse `Retry-After-Ms` or `Retry-After` headers.
///
/// Returns `Some(duration)` if a valid value is found and `0 < duration < 60s`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let in_range = |d: Duration| d > Duration::ZERO && d < MAX_RETRY_AFTER;

    if let Some(val) = headers.get("retry-after-ms")
        && let Ok(s) = val.to_str()
        && let Ok(ms) = s.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
    {
        let duration = Duration::from_secs_f64(ms / 1000.0);
        if in_range(duration) {
            return Some(duration);
        }
    }

    if let Some(val) = headers.get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if in_range(duration) {
            return Some(duration);
        }
    }

    None
}

/// 5xx, 408 and 429 are worth retrying; everything else is final.
#[must_use]
pub fn is_transient_status(status: StatusCode) -> bool {
    status.as_u16() >= 500
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[must_use]
pub fn generate_idempotency_key() -> String {
    format!("keystone-{}", Uuid::new_v4())
}

/// Where a retry loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `attempt` is in flight.
    Attempting { attempt: u32 },
    /// Sleeping `delay` before attempt `attempt`.
    Waiting { attempt: u32, delay: Duration },
    Succeeded { attempt: u32 },
    Failed { attempt: u32 },
}

impl RetryState {
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        match *self {
            Self::Attempting { attempt }
            | Self::Waiting { attempt, .. }
            | Self::Succeeded { attempt }
            | Self::Failed { attempt } => attempt,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Drives one retry loop through [`RetryState`].
///
/// Shared by the fetcher and the generic retry wrapper so both count
/// attempts and compute delays identically.
#[derive(Debug)]
pub struct RetrySchedule<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
}

impl<'a> RetrySchedule<'a> {
    #[must_use]
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting { attempt: 0 },
        }
    }

    #[must_use]
    pub fn state(&self) -> RetryState {
        self.state
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.state.attempt()
    }

    /// Whether a failure of the current attempt may be retried.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.policy.retry_on_transient_error && self.attempt() < self.policy.max_retries
    }

    #[must_use]
    pub fn context(&self, retryable: bool) -> RetryContext {
        RetryContext::new(self.attempt(), self.policy.max_retries, retryable)
    }

    /// Move to `Waiting` and return the delay before the next attempt.
    pub fn schedule_retry(&mut self, hint: Option<Duration>) -> Duration {
        let attempt = self.attempt();
        let delay = self.policy.delay_for(attempt, hint);
        self.state = RetryState::Waiting {
            attempt: attempt + 1,
            delay,
        };
        delay
    }

    /// Sleep out a scheduled delay, then mark the next attempt in flight.
    pub async fn wait(&mut self) {
        if let RetryState::Waiting { attempt, delay } = self.state {
            tokio::time::sleep(delay).await;
            self.state = RetryState::Attempting { attempt };
        }
    }

    pub fn succeed(&mut self) {
        self.state = RetryState::Succeeded {
            attempt: self.attempt(),
        };
    }

    pub fn fail(&mut self) {
        self.state = RetryState::Failed {
            attempt: self.attempt(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_respects_cap_and_saturates() {
        let policy = RetryPolicy {
            max_delay: Some(Duration::from_secs(3)),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(3));

        let uncapped = RetryPolicy::default();
        assert!(uncapped.backoff_delay(64) >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.25,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn parse_retry_after_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_retry_after_out_of_range() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("0"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.clear();
        headers.insert("retry-after-ms", HeaderValue::from_static("-5"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn hint_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(4000));
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));

        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::CONFLICT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn idempotency_keys_are_unique() {
        let a = generate_idempotency_key();
        let b = generate_idempotency_key();
        assert!(a.starts_with("keystone-"));
        assert_ne!(a, b);
    }

    #[test]
    fn schedule_walks_through_states() {
        let policy = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let mut schedule = RetrySchedule::new(&policy);
        assert_eq!(schedule.state(), RetryState::Attempting { attempt: 0 });
        assert!(schedule.can_retry());

        let delay = schedule.schedule_retry(None);
        assert_eq!(delay, Duration::from_millis(1000));
        assert_eq!(
            schedule.state(),
            RetryState::Waiting {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert!(!schedule.can_retry());

        schedule.fail();
        assert_eq!(schedule.state(), RetryState::Failed { attempt: 1 });
        assert!(schedule.state().is_terminal());
        assert_eq!(schedule.context(false), RetryContext::new(1, 1, false));
    }

    #[test]
    fn disabled_retries_never_retry() {
        let policy = RetryPolicy {
            retry_on_transient_error: false,
            ..RetryPolicy::default()
        };
        assert!(!RetrySchedule::new(&policy).can_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_scheduled_delay() {
        let policy = RetryPolicy::default();
        let mut schedule = RetrySchedule::new(&policy);
        schedule.schedule_retry(None);

        let start = tokio::time::Instant::now();
        schedule.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert_eq!(schedule.state(), RetryState::Attempting { attempt: 1 });
    }
}

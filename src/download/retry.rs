//! Retry classification and exponential backoff for transient failures.
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! transient and rate-limited failures retry with capped, jittered
//! exponential backoff; permanent failures fail immediately without
//! consuming the remaining budget.
//!
//! Rate-limited responses may carry a `Retry-After` header; when present
//! and parseable, that delay is preferred over the computed backoff (capped
//! at [`MAX_RETRY_AFTER`](super::constants::MAX_RETRY_AFTER)).

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RETRIES, MAX_RETRY_AFTER,
};

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to computed delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a download failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, connection reset, 5xx server errors,
    /// a size-verification mismatch after a stream claimed success.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, local file system errors.
    Permanent,

    /// Server rate limiting (HTTP 429). Retryable; honors Retry-After.
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Retry budget and backoff configuration.
///
/// Delay formula: `min(base * multiplier^(attempt-1), cap) + jitter`. With
/// defaults the sequence is roughly 1s, 2s, 4s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial one.
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Delay cap before jitter.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_CAP,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings. `max_attempts` is clamped to
    /// at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Policy with a custom attempt budget and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether the attempt that just failed should be retried.
    ///
    /// `attempt` is the 1-indexed attempt that failed. `retry_after` is the
    /// server-requested delay, if the failure carried one; it overrides the
    /// computed backoff.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(
        &self,
        failure_type: FailureType,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure, retry would not help".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = match retry_after {
            Some(requested) => requested.min(MAX_RETRY_AFTER),
            None => self.calculate_delay(attempt),
        };

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

    /// Backoff delay for a retry, capped and jittered.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt 1 maps to multiplier^0, so the first retry waits base_delay.
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Random jitter in `[0, MAX_JITTER]` to avoid synchronized retries.
    fn calculate_jitter(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a download error into a failure type.
///
/// HTTP statuses: 429 is rate-limited, 408 and 5xx are transient, all other
/// 4xx are permanent (416 never reaches classification; the probe reports it
/// as already-complete). Timeouts and most network errors are transient, but
/// TLS failures are permanent. Local IO and invalid URLs are permanent. A
/// verification mismatch is transient: the file is re-probed and the tail
/// re-fetched on retry.
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::RemoteStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } => FailureType::Transient,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        // The coordinator intercepts this before classification and restarts
        // from zero; if one somehow escapes, a retry re-probes and recovers.
        DownloadError::RangeNotHonored { .. } => FailureType::Transient,

        DownloadError::VerificationMismatch { .. } => FailureType::Transient,

        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => FailureType::Permanent,
    }
}

/// Server-requested retry delay carried by the error, if any.
#[must_use]
pub fn retry_after_delay(error: &DownloadError) -> Option<Duration> {
    match error {
        DownloadError::RemoteStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

/// Parses a `Retry-After` header value: either delta-seconds or an HTTP
/// date. Unparseable values and dates in the past yield `None`; results are
/// capped at [`MAX_RETRY_AFTER`].
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }

    let when = httpdate::parse_http_date(value).ok()?;
    let delay = when.duration_since(SystemTime::now()).ok()?;
    Some(delay.min(MAX_RETRY_AFTER))
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        // Anything else here is unexpected, treat as permanent.
        _ => FailureType::Permanent,
    }
}

/// Checks whether a reqwest error is a TLS/certificate failure.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_delay_calculation_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32));

        let first = policy.calculate_delay(1);
        assert!(first >= Duration::from_secs(1));
        assert!(first <= Duration::from_millis(1500));

        let second = policy.calculate_delay(2);
        assert!(second >= Duration::from_secs(2));
        assert!(second <= Duration::from_millis(2500));

        let third = policy.calculate_delay(3);
        assert!(third >= Duration::from_secs(4));
        assert!(third <= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_calculation_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        // 6th attempt uncapped would be 32s.
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(policy.calculate_jitter() <= MAX_JITTER);
        }
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1, None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_transient_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Transient, 1, None);
        if let RetryDecision::Retry { attempt, .. } = decision {
            assert_eq!(attempt, 2);
        } else {
            panic!("Expected Retry, got: {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);

        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1, None),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2, None),
            RetryDecision::Retry { .. }
        ));

        let decision = policy.should_retry(FailureType::Transient, 3, None);
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("exhausted"));
        } else {
            panic!("Expected DoNotRetry, got: {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_prefers_retry_after() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(
            FailureType::RateLimited,
            1,
            Some(Duration::from_secs(10)),
        );
        if let RetryDecision::Retry { delay, .. } = decision {
            assert_eq!(delay, Duration::from_secs(10));
        } else {
            panic!("Expected Retry, got: {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_caps_retry_after() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(
            FailureType::RateLimited,
            1,
            Some(Duration::from_secs(86_400)),
        );
        if let RetryDecision::Retry { delay, .. } = decision {
            assert_eq!(delay, MAX_RETRY_AFTER);
        } else {
            panic!("Expected Retry, got: {decision:?}");
        }
    }

    #[test]
    fn test_should_retry_delay_increases() {
        let policy = RetryPolicy::default();

        let first = policy.should_retry(FailureType::Transient, 1, None);
        let second = policy.should_retry(FailureType::Transient, 2, None);

        if let (
            RetryDecision::Retry { delay: delay1, .. },
            RetryDecision::Retry { delay: delay2, .. },
        ) = (first, second)
        {
            assert!(delay2 > delay1);
        } else {
            panic!("Expected both to be Retry decisions");
        }
    }

    #[test]
    fn test_classify_http_statuses() {
        let status = |code| DownloadError::remote_status("http://example.com", code);

        assert_eq!(classify_error(&status(400)), FailureType::Permanent);
        assert_eq!(classify_error(&status(401)), FailureType::Permanent);
        assert_eq!(classify_error(&status(403)), FailureType::Permanent);
        assert_eq!(classify_error(&status(404)), FailureType::Permanent);
        assert_eq!(classify_error(&status(408)), FailureType::Transient);
        assert_eq!(classify_error(&status(410)), FailureType::Permanent);
        assert_eq!(classify_error(&status(429)), FailureType::RateLimited);
        assert_eq!(classify_error(&status(500)), FailureType::Transient);
        assert_eq!(classify_error(&status(502)), FailureType::Transient);
        assert_eq!(classify_error(&status(503)), FailureType::Transient);
        assert_eq!(classify_error(&status(504)), FailureType::Transient);
    }

    #[test]
    fn test_classify_timeout_transient() {
        let error = DownloadError::timeout("http://example.com");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_invalid_url_permanent() {
        let error = DownloadError::invalid_url("not-a-url");
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_io_error_permanent() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::io("/path/to/file", io_err);
        assert_eq!(classify_error(&error), FailureType::Permanent);
    }

    #[test]
    fn test_classify_verification_mismatch_transient() {
        let error = DownloadError::verification("/tmp/f.part", 100, 90);
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_caps_large_values() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = SystemTime::now() + Duration::from_secs(90);
        let value = httpdate::fmt_http_date(future);
        let delay = parse_retry_after(&value).unwrap();
        assert!(delay > Duration::from_secs(80));
        assert!(delay <= Duration::from_secs(90));
    }

    #[test]
    fn test_parse_retry_after_past_date_and_garbage() {
        let past = SystemTime::now() - Duration::from_secs(90);
        assert_eq!(parse_retry_after(&httpdate::fmt_http_date(past)), None);
        assert_eq!(parse_retry_after("soonish"), None);
    }

    #[test]
    fn test_retry_after_delay_reads_remote_status() {
        let error = DownloadError::remote_status_with_retry_after(
            "http://example.com",
            429,
            Some("30".to_string()),
        );
        assert_eq!(retry_after_delay(&error), Some(Duration::from_secs(30)));

        let bare = DownloadError::remote_status("http://example.com", 429);
        assert_eq!(retry_after_delay(&bare), None);
    }
}

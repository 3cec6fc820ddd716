//! Uniform retry & timeout policy for every cloud client call: a request
//! timeout (default 30s), up to 3 retries on transient failures with
//! exponential backoff (base 1s, factor 2, jitter +/-20%). 4xx is not
//! retried except 408 and 429. HTTP 413 on snapshot creation is classified
//! separately as a terminal, non-retriable `SizeRejected`.

use rand::Rng;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let jitter = base * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// Classifies an HTTP status code into the closed error taxonomy. Called on
/// every cloud client response before it crosses the component boundary.
pub fn classify_status(status: StatusCode, body: impl Into<String>) -> Error {
    let body = body.into();
    match status {
        StatusCode::UNAUTHORIZED => Error::AuthError(body),
        StatusCode::FORBIDDEN => Error::ForbiddenError(body),
        StatusCode::NOT_FOUND => Error::NotFound(body),
        StatusCode::CONFLICT => Error::ConflictError(body),
        StatusCode::PAYLOAD_TOO_LARGE => Error::SizeRejected(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::Transient(body),
        s if s.is_server_error() => Error::Transient(body),
        s if s.is_client_error() => Error::ConflictError(body),
        _ => Error::Internal(format!("unexpected status {status}: {body}")),
    }
}

/// True for outcomes the retry loop below should retry.
fn is_retriable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Runs `op` under the uniform retry policy. `op` returns either a classified
/// `Error` (non-retriable outcomes should already be mapped via
/// [`classify_status`] before reaching here, except transient ones which are
/// retried directly) or a success value.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retriable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(op = label, attempt, ?delay, error = %e, "retrying transient cloud call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    debug!(op = label, attempts = attempt + 1, "cloud call exhausted retries or failed terminally");
                }
                return Err(e);
            }
        }
    }
}

/// True when `status` should be retried per the uniform policy, used by
/// adapters that want to decide before fully classifying the response body.
pub fn should_retry(status: StatusCode) -> bool {
    is_retriable(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_413_is_size_rejected_not_transient() {
        let err = classify_status(StatusCode::PAYLOAD_TOO_LARGE, "too big");
        assert!(matches!(err, Error::SizeRejected(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn classify_5xx_is_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "oops");
        assert!(err.is_retriable());
    }

    #[test]
    fn classify_429_is_transient_and_retriable_at_status_level() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), Error> = retry_with_backoff(&policy, "test", || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Error::Transient("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_on_non_retriable_error() {
        let policy = RetryPolicy::default();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), Error> = retry_with_backoff(&policy, "test", || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(Error::NotFound("gone".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

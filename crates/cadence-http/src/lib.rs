//! Upstream HTTP plumbing: normalized failures, retry classification and the
//! exponential backoff executor that wraps every outbound call.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cadence-http";

/// A failure that may carry an upstream HTTP status.
pub trait StatusCoded {
    fn status_code(&self) -> Option<u16>;
}

/// Every upstream failure is normalized into this shape where it is first
/// observed, so retry decisions only ever read `status`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn without_status(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn from_response(status: StatusCode, url: &str, body: &str) -> Self {
        let body = body.trim();
        let message = if body.is_empty() {
            format!("http status {} for {url}", status.as_u16())
        } else {
            format!("http status {} for {url}: {body}", status.as_u16())
        };
        Self::with_status(status.as_u16(), message)
    }
}

impl StatusCoded for UpstreamError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            message: format!("request failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and every 5xx are transient; everything else is permanent.
pub fn classify_status(status: u16) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..=599).contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_error<E: StatusCoded>(err: &E) -> RetryDisposition {
    err.status_code()
        .map(classify_status)
        .unwrap_or(RetryDisposition::NonRetryable)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total calls, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("CADENCE_RETRY_MAX_ATTEMPTS", defaults.max_attempts),
            initial_delay: Duration::from_millis(env_or(
                "CADENCE_RETRY_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )),
        }
    }

    /// Wait before retry number `retry_index` (zero-based): `initial * 2^index`.
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Runs `operation`, retrying transient failures with exponential backoff.
    /// Failures are returned exactly as the operation produced them.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StatusCoded + std::fmt::Display,
    {
        execute(self, operation).await
    }
}

pub async fn execute<T, E, F, Fut>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StatusCoded + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut retry_index = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if classify_error(&err) == RetryDisposition::NonRetryable
            || retry_index + 1 >= max_attempts
        {
            return Err(err);
        }

        let delay = policy.delay_for_retry(retry_index);
        warn!(
            attempt = retry_index + 1,
            max_attempts,
            status = err.status_code(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient upstream failure, backing off"
        );
        tokio::time::sleep(delay).await;
        retry_index += 1;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: Some(format!("cadence/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

/// Reads and parses an environment variable, falling back to `default` when
/// it is unset or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn scripted(
        outcomes: Vec<Result<&'static str, UpstreamError>>,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<&'static str, UpstreamError>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
            let outcome = outcomes
                .get(n)
                .or_else(|| outcomes.last())
                .cloned()
                .expect("at least one scripted outcome");
            std::future::ready(outcome)
        };
        (calls, op)
    }

    fn failure(status: u16, message: &str) -> Result<&'static str, UpstreamError> {
        Err(UpstreamError::with_status(status, message))
    }

    #[test]
    fn classification_covers_rate_limit_and_server_errors() {
        assert_eq!(classify_status(429), RetryDisposition::Retryable);
        assert_eq!(classify_status(500), RetryDisposition::Retryable);
        assert_eq!(classify_status(599), RetryDisposition::Retryable);
        assert_eq!(classify_status(400), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(404), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(600), RetryDisposition::NonRetryable);
        assert_eq!(
            classify_error(&UpstreamError::without_status("socket hang up")),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(100).saturating_mul(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_calls_once_without_delay() {
        let (calls, op) = scripted(vec![Ok("done")]);
        let started = Instant::now();
        let result = execute(&BackoffPolicy::default(), op).await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_once_after_initial_delay() {
        let (calls, op) = scripted(vec![failure(429, "Rate limited"), Ok("done")]);
        let started = Instant::now();
        let result = execute(&BackoffPolicy::default(), op).await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_back_off_exponentially() {
        let (calls, op) = scripted(vec![
            failure(500, "Server error"),
            failure(503, "Service unavailable"),
            Ok("done"),
        ]);
        let policy = BackoffPolicy::new(3, Duration::from_millis(10));
        let started = Instant::now();
        let result = policy.execute(op).await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_request_is_not_retried() {
        let (calls, op) = scripted(vec![failure(400, "Bad request")]);
        let started = Instant::now();
        let err = execute(&BackoffPolicy::default(), op).await.unwrap_err();
        assert_eq!(err, UpstreamError::with_status(400, "Bad request"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_status_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = execute(&BackoffPolicy::default(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(UpstreamError::without_status("Generic error")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Generic error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_return_last_failure() {
        let (calls, op) = scripted(vec![
            failure(429, "first"),
            failure(502, "second"),
            failure(503, "last"),
        ]);
        let policy = BackoffPolicy::new(3, Duration::from_millis(1));
        let err = policy.execute(op).await.unwrap_err();
        assert_eq!(err, UpstreamError::with_status(503, "last"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_calls_once() {
        let (calls, op) = scripted(vec![failure(500, "down")]);
        let policy = BackoffPolicy::new(0, Duration::from_millis(1));
        assert!(policy.execute(op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

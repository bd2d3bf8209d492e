//! Retrying HTTP client
//!
//! Every request runs inside the client's circuit breaker. Within one breaker
//! call a request is attempted up to `max_attempts` times:
//!
//! - 2xx: success
//! - 429, 500, 502, 503, 504: retried, honoring `Retry-After`
//! - any other status: fails immediately
//! - connect errors and timeouts: retried
//!
//! Each attempt is bounded by `timeout_ms`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{truncate_body, ResilienceError, Result, RETRYABLE_STATUSES};

/// Header carrying the caller's idempotency key
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound applied to server-provided `Retry-After`
    #[serde(default = "default_max_retry_after_ms")]
    pub max_retry_after_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retry_after_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_timeout_ms(),
            max_retry_after_ms: default_max_retry_after_ms(),
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.max_delay_ms);
        let half = capped / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.max(1));
        Duration::from_millis(half + jitter)
    }

    /// Delay requested by the server, capped and lightly jittered
    pub fn retry_after_delay(&self, requested: Duration) -> Duration {
        let capped = requested.min(Duration::from_millis(self.max_retry_after_ms));
        let factor: f64 = rand::thread_rng().gen_range(1.0_f64..=1.1_f64);
        Duration::from_millis(((capped.as_millis() as f64) * factor).round() as u64)
    }
}

/// Parse `Retry-After`: delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn retry_after_from(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}

enum AttemptError {
    Retryable {
        error: ResilienceError,
        retry_after: Option<Duration>,
    },
    Fatal(ResilienceError),
}

/// HTTP client with bounded retry inside a circuit breaker
#[derive(Debug, Clone)]
pub struct RetryingClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl RetryingClient {
    pub fn new(
        base_url: impl Into<String>,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("proofpay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ResilienceError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            policy,
            breaker,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.send_json(Method::GET, path, None, None).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Value> {
        self.send_json(Method::POST, path, Some(body), idempotency_key)
            .await
    }

    /// Send a request and decode the JSON response (`null` for empty bodies)
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value> {
        let headers: Vec<(&str, &str)> = idempotency_key
            .map(|key| vec![(IDEMPOTENCY_KEY_HEADER, key)])
            .unwrap_or_default();
        self.send_json_with_headers(method, path, body, &headers)
            .await
    }

    /// Like [`send_json`](Self::send_json), with arbitrary extra headers
    pub async fn send_json_with_headers(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.breaker
            .call(self.with_retries(&method, &url, body, headers))
            .await
    }

    async fn with_retries(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<Value> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(method, url, body, headers, attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retryable { error, .. }) if attempt >= max_attempts => {
                    return Err(error)
                }
                Err(AttemptError::Retryable { error, retry_after }) => {
                    let delay = match retry_after {
                        Some(requested) => self.policy.retry_after_delay(requested),
                        None => self.policy.backoff(attempt),
                    };
                    warn!(
                        error = %error,
                        url = %url,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
        attempt: u32,
    ) -> std::result::Result<Value, AttemptError> {
        let mut request = self.http.request(method.clone(), url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(AttemptError::Retryable {
                    error: ResilienceError::Transport {
                        message: e.to_string(),
                        attempts: attempt,
                        timed_out: e.is_timeout(),
                    },
                    retry_after: None,
                })
            }
            Err(_) => {
                return Err(AttemptError::Retryable {
                    error: ResilienceError::Transport {
                        message: format!("request timed out after {}ms", self.policy.timeout_ms),
                        attempts: attempt,
                        timed_out: true,
                    },
                    retry_after: None,
                })
            }
        };

        let status = response.status().as_u16();
        let retry_after = retry_after_from(response.headers());
        let text = match tokio::time::timeout(timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(AttemptError::Retryable {
                    error: ResilienceError::Transport {
                        message: format!("failed to read response body: {e}"),
                        attempts: attempt,
                        timed_out: e.is_timeout(),
                    },
                    retry_after: None,
                })
            }
            Err(_) => {
                return Err(AttemptError::Retryable {
                    error: ResilienceError::Transport {
                        message: "timed out reading response body".to_string(),
                        attempts: attempt,
                        timed_out: true,
                    },
                    retry_after: None,
                })
            }
        };

        if (200..300).contains(&status) {
            debug!(url = %url, status = status, attempt = attempt, "Request succeeded");
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| AttemptError::Fatal(ResilienceError::Decode(e.to_string())));
        }

        let error = ResilienceError::ProcessorRequestFailure {
            status,
            body: truncate_body(&text),
            attempts: attempt,
        };
        if RETRYABLE_STATUSES.contains(&status) {
            Err(AttemptError::Retryable { error, retry_after })
        } else {
            Err(AttemptError::Fatal(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_retry_after_seconds_and_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 300,
            ..RetryPolicy::default()
        };
        for _ in 0..20 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let late = policy.backoff(10);
            assert!(late >= Duration::from_millis(150) && late <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy {
            max_retry_after_ms: 1_000,
            ..RetryPolicy::default()
        };
        let delay = policy.retry_after_delay(Duration::from_secs(3600));
        assert!(delay <= Duration::from_millis(1_100));
        assert!(delay >= Duration::from_millis(1_000));
    }
}

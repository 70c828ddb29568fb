use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::info;

pub const USER_AGENT: &str = "Newsshelf/0.1.0";

/// Retry policy shared by the external API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(cfg: Option<&common::RetryConfig>) -> Self {
        let default = Self::default();
        Self {
            max_attempts: cfg.and_then(|c| c.max_attempts).unwrap_or(default.max_attempts).max(1),
            base_backoff: cfg
                .and_then(|c| c.base_backoff_ms)
                .map(Duration::from_millis)
                .unwrap_or(default.base_backoff),
        }
    }

    /// Backoff before `attempt` (1-based): 0, base, 2*base, 4*base... plus up to 10% jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let base = self.base_backoff * 2u32.saturating_pow(attempt - 2);
        let jitter_cap = (base.as_millis() / 10) as u64;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// Why a request ultimately failed after the retry loop gave up.
#[derive(Debug)]
pub struct HttpFailure {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Statuses worth another attempt: server errors and rate limiting.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Build a client with the shared user agent and a per-request timeout.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Send a request built by `make`, retrying transport errors, 5xx and 429 with
/// exponential backoff. Other client errors (4xx) are returned immediately.
/// On success the response is returned with its body unread.
pub async fn send_with_retry<F>(policy: &RetryPolicy, what: &str, mut make: F) -> Result<Response, HttpFailure>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            let backoff = policy.backoff_for(attempt);
            info!(target_name = what, attempt, max_attempts = policy.max_attempts, ?backoff, "retrying request");
            tokio::time::sleep(backoff).await;
        }

        match make().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                let failure = HttpFailure {
                    status: Some(status),
                    message: format!("{} returned {}: {}", what, status, truncate_for_log(&body, 300)),
                };
                if !is_retryable(status) {
                    // Client error (4xx) - likely permanent, don't retry
                    return Err(failure);
                }
                last_error = Some(failure);
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("{} request timed out", what)
                } else {
                    format!("{} network error: {}", what, e)
                };
                last_error = Some(HttpFailure { status: None, message });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| HttpFailure {
        status: None,
        message: format!("{} failed with no attempts made", what),
    }))
}

/// Cut `s` to at most `max_chars` characters for log and error messages.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff_for(1), Duration::ZERO);

        let second = policy.backoff_for(2);
        assert!(second >= Duration::from_millis(1000) && second <= Duration::from_millis(1100));

        let fourth = policy.backoff_for(4);
        assert!(fourth >= Duration::from_millis(4000) && fourth <= Duration::from_millis(4400));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn policy_from_config_keeps_at_least_one_attempt() {
        let cfg = common::RetryConfig {
            max_attempts: Some(0),
            base_backoff_ms: Some(50),
        };
        let policy = RetryPolicy::from_config(Some(&cfg));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_backoff, Duration::from_millis(50));
        assert_eq!(RetryPolicy::from_config(None), RetryPolicy::default());
    }

    #[test]
    fn truncate_is_char_aware() {
        assert_eq!(truncate_for_log("héllo", 2), "hé...");
        assert_eq!(truncate_for_log("short", 10), "short");
    }
}

//! Timeouts and retries around calls to external services.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use campus_chat_core::retry::RetryPolicy;

/// Run `fut`, failing with a descriptive error if it takes longer than `limit`.
pub async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {}s", what, limit.as_secs())),
    }
}

/// Call `op` until it succeeds or `policy` runs out of attempts.
///
/// Errors marked permanent with [`Permanent`] end the loop immediately.
pub async fn with_retry<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts();
    let mut last_err = None;

    for attempt in 0..attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is::<Permanent>() => return Err(e),
            Err(e) => {
                if attempt + 1 < attempts {
                    tracing::warn!(
                        target: "campus_chat::upstream",
                        what,
                        attempt = attempt + 1,
                        error = %e,
                        "retrying upstream call"
                    );
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed", what)))
}

/// Marks an error that retrying cannot fix (e.g. HTTP 400 from a provider).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Permanent(pub String);

/// Classify an HTTP error status: 429 and 5xx are worth retrying.
pub fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        anyhow!(message)
    } else {
        anyhow::Error::new(Permanent(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_timeout_fires() {
        let result: Result<()> = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_no_policy_means_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("op", RetryPolicy::None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("boom"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_retrying() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::Backoff {
            retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let result: Result<()> = with_retry("op", policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::Error::new(Permanent("bad request".into())))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::Backoff {
            retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let result = with_retry("op", policy, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(anyhow!("flaky"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_status_classification() {
        let e = status_error("OpenAI", reqwest::StatusCode::BAD_REQUEST, "nope");
        assert!(e.is::<Permanent>());
        let e = status_error("OpenAI", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(!e.is::<Permanent>());
    }
}

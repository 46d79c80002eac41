use crate::backends::{Completion, LlmBackend};
use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult, Message};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for failover across a tier's models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Returns `true` for rate-limit (429), timeout, and server errors (5xx).
/// Returns `false` for client errors like 400 or 401 which are not expected
/// to succeed on retry against the same model.
pub fn is_retryable(err: &ForgeError) -> bool {
    if matches!(err, ForgeError::Timeout(_)) {
        return true;
    }

    let lower = err.to_string().to_lowercase();

    if lower.contains("400") || lower.contains("401") || lower.contains("403") {
        return false;
    }

    lower.contains("429")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("5xx")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// An `LlmBackend` that wraps a tier's backends in preference order and
/// performs automatic failover with exponential-backoff retries.
///
/// Within each backend it retries up to `max_retries` times for transient
/// errors. A non-retryable error, or exhausted retries, moves on to the next
/// backend. If every backend fails, the last error is returned.
pub struct FailoverBackend {
    backends: Vec<Box<dyn LlmBackend>>,
    policy: RetryPolicy,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverBackend {
    /// Create a failover backend. Fails if `backends` is empty.
    pub fn new(backends: Vec<Box<dyn LlmBackend>>, policy: RetryPolicy) -> ForgeResult<Self> {
        if backends.is_empty() {
            return Err(ForgeError::Config(
                "FailoverBackend requires at least one backend".into(),
            ));
        }
        Ok(Self {
            backends,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    /// Number of wrapped backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false; construction rejects an empty list.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl LlmBackend for FailoverBackend {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[Message],
    ) -> ForgeResult<Completion> {
        let mut last_err: Option<ForgeError> = None;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                match backend.complete(system_prompt, messages).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if !is_retryable(&e) {
                            warn!(
                                backend = backend_idx,
                                attempt,
                                error = %e,
                                "Non-retryable error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(
                                backend = backend_idx,
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Retryable error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ForgeError::Agent("All failover backends exhausted".into())))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A mock backend that returns a sequence of results.
    struct MockBackend {
        results: tokio::sync::Mutex<Vec<ForgeResult<Completion>>>,
        call_count: Arc<AtomicU32>,
    }

    impl MockBackend {
        fn new(results: Vec<ForgeResult<Completion>>) -> Self {
            Self {
                results: tokio::sync::Mutex::new(results),
                call_count: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        async fn complete(
            &self,
            _system_prompt: Option<&str>,
            _messages: &[Message],
        ) -> ForgeResult<Completion> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(ForgeError::Agent("MockBackend: no more results".into()))
            } else {
                results.remove(0)
            }
        }
    }

    fn ok(text: &str) -> ForgeResult<Completion> {
        Ok(Completion {
            text: text.into(),
            tokens_used: 10,
            model: "mock".into(),
        })
    }

    fn http(msg: &str) -> ForgeResult<Completion> {
        Err(ForgeError::Http(msg.into()))
    }

    fn http_n(msg: &str, n: usize) -> Vec<ForgeResult<Completion>> {
        (0..n).map(|_| http(msg)).collect()
    }

    fn failover(backends: Vec<Box<dyn LlmBackend>>) -> FailoverBackend {
        FailoverBackend {
            backends,
            policy: RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 0,
                backoff_max_ms: 0,
            },
            sleep_fn: Some(Box::new(|_| Box::pin(async {}))),
        }
    }

    // ── retry succeeds on second attempt ──────────────────────────────────

    #[tokio::test]
    async fn retry_succeeds_on_second_try() {
        let f = failover(vec![Box::new(MockBackend::new(vec![
            http("429 Too Many Requests"),
            ok("ok"),
        ]))]);

        let result = f.complete(None, &[]).await.unwrap();
        assert_eq!(result.text, "ok");
    }

    // ── all backends fail, returns last error ─────────────────────────────

    #[tokio::test]
    async fn all_backends_fail_returns_last_error() {
        let f = failover(vec![
            Box::new(MockBackend::new(http_n("500 Internal Server Error", 4))),
            Box::new(MockBackend::new(http_n("503 Service Unavailable", 4))),
        ]);

        let err_msg = f.complete(None, &[]).await.unwrap_err().to_string();
        assert!(err_msg.contains("503"), "Expected last error (503), got: {err_msg}");
    }

    // ── non-retryable error skips retries immediately ─────────────────────

    #[tokio::test]
    async fn non_retryable_skips_immediately() {
        let first = MockBackend::new(vec![http("400 Bad Request"), ok("should not reach")]);
        let first_calls = first.call_count.clone();
        let f = failover(vec![
            Box::new(first),
            Box::new(MockBackend::new(vec![ok("fallback ok")])),
        ]);

        let result = f.complete(None, &[]).await.unwrap();
        assert_eq!(result.text, "fallback ok");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    }

    // ── failover after retries are exhausted ──────────────────────────────

    #[tokio::test]
    async fn failover_to_second_backend() {
        let first = MockBackend::new(http_n("502 Bad Gateway", 4));
        let first_calls = first.call_count.clone();
        let f = failover(vec![
            Box::new(first),
            Box::new(MockBackend::new(vec![ok("second backend")])),
        ]);

        let result = f.complete(None, &[]).await.unwrap();
        assert_eq!(result.text, "second backend");
        assert_eq!(first_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn empty_backend_list_rejected() {
        assert!(FailoverBackend::new(Vec::new(), RetryPolicy::default()).is_err());
    }

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        };

        assert_eq!(compute_backoff(&policy, 0), 500);
        assert_eq!(compute_backoff(&policy, 1), 1000);
        assert_eq!(compute_backoff(&policy, 3), 4000);
        assert_eq!(compute_backoff(&policy, 5), 16000);
        assert_eq!(compute_backoff(&policy, 6), 30_000);
    }

    #[test]
    fn is_retryable_classification() {
        assert!(is_retryable(&ForgeError::Http("429 Too Many Requests".into())));
        assert!(is_retryable(&ForgeError::Http("timeout waiting for response".into())));
        assert!(is_retryable(&ForgeError::Http("503 Service Unavailable".into())));
        assert!(is_retryable(&ForgeError::Timeout("completion".into())));
        assert!(is_retryable(&ForgeError::Agent("5xx class error".into())));

        assert!(!is_retryable(&ForgeError::Http("400 Bad Request".into())));
        assert!(!is_retryable(&ForgeError::Http("401 Unauthorized".into())));
    }
}

//! Retry decorator for the client surface.
//!
//! Wraps any [`Client`] and retries failed `chat` calls with exponential
//! backoff and symmetric jitter. Cancellation, configuration errors, and
//! 4xx-shaped provider errors are never retried. Streaming is passed
//! through untouched; mid-stream retries would require replay logic the
//! core does not implement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::llm::client::{ChatRequest, ChatResponse, ChunkStream, Client, LlmError, ModelInfo};

/// Retry policy parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Additional attempts after the first failure. Zero disables wrapping.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Wrap a client with the retry policy. Returns the inner client unchanged
/// when retries are disabled.
pub fn with_retry(inner: Arc<dyn Client>, cfg: RetryConfig) -> Arc<dyn Client> {
    if cfg.max_retries == 0 {
        return inner;
    }
    let cfg = RetryConfig {
        initial_backoff: if cfg.initial_backoff.is_zero() {
            Duration::from_secs(1)
        } else {
            cfg.initial_backoff
        },
        max_backoff: if cfg.max_backoff.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.max_backoff
        },
        ..cfg
    };
    Arc::new(RetryingClient { inner, cfg })
}

struct RetryingClient {
    inner: Arc<dyn Client>,
    cfg: RetryConfig,
}

#[async_trait]
impl Client for RetryingClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut last_err = None;

        for attempt in 0..=self.cfg.max_retries {
            match self.inner.chat(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(err);
                    }
                    if attempt == self.cfg.max_retries {
                        last_err = Some(err);
                        break;
                    }
                    let sleep = backoff_for_attempt(&self.cfg, attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = sleep.as_millis() as u64,
                        error = %err,
                        "model call failed, retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(sleep).await;
                }
            }
        }

        Err(last_err.unwrap_or(LlmError::Transport("retry loop exhausted".to_string())))
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, LlmError> {
        self.inner.stream(req).await
    }

    fn model_info(&self) -> &ModelInfo {
        self.inner.model_info()
    }

    async fn ping(&self) -> Result<(), LlmError> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Exponential backoff `initial · 2^attempt`, clamped to the maximum, with
/// symmetric ±20% jitter.
fn backoff_for_attempt(cfg: &RetryConfig, attempt: u32) -> Duration {
    let mut backoff = cfg.initial_backoff;
    for _ in 0..attempt {
        backoff = backoff.saturating_mul(2);
        if backoff >= cfg.max_backoff {
            backoff = cfg.max_backoff;
            break;
        }
    }
    if backoff > cfg.max_backoff {
        backoff = cfg.max_backoff;
    }

    let jitter_frac: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    let sleep = backoff.as_secs_f64() * (1.0 + jitter_frac);
    Duration::from_secs_f64(sleep.max(0.0))
}

/// Retry classification. Pure: the verdict for an error depends only on its
/// variant and message text.
pub fn is_retryable(err: &LlmError) -> bool {
    match err {
        // Cancellation propagates immediately, by identity.
        LlmError::Cancelled => false,
        // Misconfiguration will not heal on retry.
        LlmError::Config(_) => false,
        // Unparseable wire data will decode the same way next time.
        LlmError::Protocol(_) => false,
        LlmError::Provider { status, .. } if (400..500).contains(status) => false,
        other => {
            // Transport errors sometimes wrap an upstream status in text.
            let msg = other.to_string().to_lowercase();
            !(msg.contains("api error 4")
                || msg.contains("status 4")
                || msg.contains(" 400")
                || msg.contains(" 401")
                || msg.contains(" 403")
                || msg.contains(" 404"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::FinishReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client that fails with the configured errors before succeeding.
    struct FlakyClient {
        failures: std::sync::Mutex<Vec<LlmError>>,
        calls: AtomicU32,
        info: ModelInfo,
    }

    impl FlakyClient {
        fn new(failures: Vec<LlmError>) -> Self {
            Self {
                failures: std::sync::Mutex::new(failures),
                calls: AtomicU32::new(0),
                info: ModelInfo::default(),
            }
        }
    }

    #[async_trait]
    impl Client for FlakyClient {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(ChatResponse {
                    content: "ok".to_string(),
                    finish_reason: FinishReason::Stop,
                    ..Default::default()
                })
            } else {
                Err(failures.remove(0))
            }
        }

        async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, LlmError> {
            let resp = self.chat(req).await?;
            Ok(crate::llm::client::response_as_chunks(resp))
        }

        fn model_info(&self) -> &ModelInfo {
            &self.info
        }

        async fn ping(&self) -> Result<(), LlmError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_to_success() {
        let inner = Arc::new(FlakyClient::new(vec![LlmError::Provider {
            status: 500,
            body: "internal".to_string(),
        }]));
        let client = with_retry(inner.clone(), fast_retry(2));

        let resp = client.chat(&ChatRequest::default()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let inner = Arc::new(FlakyClient::new(vec![LlmError::Provider {
            status: 401,
            body: "unauthorized".to_string(),
        }]));
        let client = with_retry(inner.clone(), fast_retry(2));

        let err = client.chat(&ChatRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Provider { status: 401, .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_retried() {
        let inner = Arc::new(FlakyClient::new(vec![LlmError::Cancelled]));
        let client = with_retry(inner.clone(), fast_retry(2));

        let err = client.chat(&ChatRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_last_error() {
        let inner = Arc::new(FlakyClient::new(vec![
            LlmError::Transport("connection reset".to_string()),
            LlmError::Transport("connection reset".to_string()),
            LlmError::Transport("connection reset".to_string()),
        ]));
        let client = with_retry(inner.clone(), fast_retry(2));

        let err = client.chat(&ChatRequest::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_retries_returns_inner_unwrapped() {
        let inner: Arc<dyn Client> = Arc::new(FlakyClient::new(vec![]));
        let wrapped = with_retry(inner.clone(), RetryConfig {
            max_retries: 0,
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&inner, &wrapped));
    }

    #[test]
    fn test_classifier_is_pure_on_message_text() {
        let server_err = LlmError::Transport("API error 500: overloaded".to_string());
        let auth_err = LlmError::Transport("API error 401: bad key".to_string());
        for _ in 0..3 {
            assert!(is_retryable(&server_err));
            assert!(!is_retryable(&auth_err));
        }
    }

    #[test]
    fn test_classifier_structural_4xx() {
        assert!(!is_retryable(&LlmError::Provider { status: 404, body: String::new() }));
        assert!(is_retryable(&LlmError::Provider { status: 503, body: String::new() }));
        assert!(!is_retryable(&LlmError::Protocol("bad json".to_string())));
        assert!(!is_retryable(&LlmError::Config("no model".to_string())));
    }

    #[test]
    fn test_backoff_doubles_and_clamps_with_jitter_bounds() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        for (attempt, base_ms) in [(0u32, 100.0f64), (1, 200.0), (2, 350.0), (5, 350.0)] {
            for _ in 0..20 {
                let sleep = backoff_for_attempt(&cfg, attempt).as_secs_f64() * 1000.0;
                assert!(sleep >= base_ms * 0.8 - 1.0, "attempt {attempt}: {sleep} too low");
                assert!(sleep <= base_ms * 1.2 + 1.0, "attempt {attempt}: {sleep} too high");
            }
        }
    }
}

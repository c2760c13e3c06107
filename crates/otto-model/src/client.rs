// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retrying HTTP client for the `/chat/completions` SSE wire format.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use otto_config::{ModelConfig, RetrySettings};

use crate::{
    error::{ErrorKind, ModelError},
    retry::{backoff_delay, parse_retry_after},
    sse::{response_chunk_stream, ChunkStream},
    types::CompletionRequest,
};

/// Capability of producing a streamed completion.  The HTTP implementation
/// is [`HttpClient`]; tests use `mock::ScriptedClient`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier this client targets (used for cost attribution).
    fn model_name(&self) -> &str;

    /// Send a completion request and return the chunk stream.
    ///
    /// Implementations must honour `cancel` at every suspension point:
    /// a cancellation observed before or during the request returns
    /// `Err(ModelError::Cancelled)`; one observed mid-stream ends the
    /// stream with that error.
    async fn complete(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ModelError>;
}

/// HTTP client for OpenAI-compatible streaming chat completions.
pub struct HttpClient {
    model: String,
    chat_url: String,
    api_key: Option<String>,
    retry: RetrySettings,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(
        model: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        retry: RetrySettings,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model: model.into(),
            chat_url: format!("{base}/chat/completions"),
            api_key,
            retry,
            http: reqwest::Client::new(),
        }
    }

    /// Construct from configuration, resolving the API key from the config
    /// value or the named environment variable.
    pub fn from_config(model: &ModelConfig, retry: RetrySettings) -> Self {
        let base = model
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        Self::new(model.name.clone(), base, model.resolve_api_key(), retry)
    }

    fn is_retryable(&self, status: u16) -> bool {
        self.retry.retryable_statuses.contains(&status)
    }

    /// Sleep for the backoff duration, returning early with `Cancelled` when
    /// the token fires mid-wait.
    async fn backoff_sleep(
        &self,
        delay: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ModelError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl ModelClient for HttpClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        mut req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ModelError> {
        // Streaming is not optional: the accumulator and the observer mirror
        // both assume a chunk stream, and usage must arrive in the final chunk.
        req.stream = true;
        req.stream_options.include_usage = true;

        let max_attempts = self.retry.max_retries + 1;
        let mut last_status: Option<u16> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            let mut http_req = self.http.post(&self.chat_url).json(&req);
            if let Some(key) = &self.api_key {
                http_req = http_req.bearer_auth(key);
            }

            let send = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                resp = http_req.send() => resp,
            };

            let resp = match send {
                Ok(r) => r,
                Err(e) => {
                    // Network-level failure: transient, retry with backoff.
                    if attempt < max_attempts {
                        let delay = backoff_delay(&self.retry, attempt);
                        warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64,
                              "model request failed; retrying");
                        self.backoff_sleep(delay, cancel).await?;
                        continue;
                    }
                    return Err(ModelError::Network(e));
                }
            };

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                debug!(model = %self.model, attempt, "completion stream open");
                return Ok(response_chunk_stream(resp, cancel.clone()));
            }

            last_status = Some(status);
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();

            if self.is_retryable(status) && attempt < max_attempts {
                // A server-specified Retry-After overrides computed backoff.
                let delay = retry_after.unwrap_or_else(|| backoff_delay(&self.retry, attempt));
                warn!(status, attempt, delay_ms = delay.as_millis() as u64,
                      "retryable model error; backing off");
                self.backoff_sleep(delay, cancel).await?;
                continue;
            }

            if self.is_retryable(status) {
                break; // retries exhausted
            }

            return Err(ModelError::Api {
                status,
                kind: ErrorKind::from_status(status),
                body,
                retry_after,
            });
        }

        Err(ModelError::MaxRetriesExceeded {
            attempts: max_attempts,
            last_status,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn client() -> HttpClient {
        HttpClient::new(
            "test-model",
            "http://localhost:9/v1",
            None,
            RetrySettings::default(),
        )
    }

    #[test]
    fn chat_url_appends_path() {
        assert_eq!(client().chat_url, "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let c = HttpClient::new("m", "http://localhost:9/v1/", None, RetrySettings::default());
        assert_eq!(c.chat_url, "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn default_retryable_statuses() {
        let c = client();
        for status in [429, 500, 502, 503, 529] {
            assert!(c.is_retryable(status), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!c.is_retryable(status), "{status} should not be retryable");
        }
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let c = client();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = CompletionRequest::new("m", vec![ChatMessage::user("q")]);
        let err = match c.complete(req, &cancel).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.is_cancelled());
    }

    // Connecting to a closed port exercises the network-retry path end to
    // end; with zero backoff the test stays fast.
    #[tokio::test]
    async fn network_failure_exhausts_retries() {
        let retry = RetrySettings {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            ..RetrySettings::default()
        };
        let c = HttpClient::new("m", "http://127.0.0.1:1/v1", None, retry);
        let req = CompletionRequest::new("m", vec![ChatMessage::user("q")]);
        let err = match c.complete(req, &CancellationToken::new()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, ModelError::Network(_)), "got {err:?}");
    }
}

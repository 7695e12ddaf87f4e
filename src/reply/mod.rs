//! Reply generation
//!
//! A turn asks the primary model for a reply. If that fails in a way a
//! second attempt might fix (model still loading, empty or malformed
//! output, timeout), it asks the fallback model once. It never tries more
//! than that, so a turn's latency stays bounded.

mod huggingface;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::retry::FallbackPolicy;
use crate::{Error, Result};

pub use huggingface::{HuggingFaceBackend, parse_response};

/// Text generation service
#[async_trait]
pub trait ReplyBackend: Send + Sync {
    /// Generate a continuation of `text` with `model`
    ///
    /// # Errors
    ///
    /// Returns `ModelWarmingUp` for retryable conditions and `Upstream`
    /// otherwise
    async fn generate(&self, text: &str, model: &str) -> Result<String>;
}

/// Work item for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Turn number
    pub turn: u64,
    /// What the speaker said
    pub input_text: String,
    /// Model the next attempt uses
    pub selected_model: String,
    /// Attempts made beyond the first
    pub retry_count: u32,
}

impl TurnRequest {
    /// Fresh request aimed at `model`
    #[must_use]
    pub fn new(turn: u64, input_text: String, model: &str) -> Self {
        Self {
            turn,
            input_text,
            selected_model: model.to_string(),
            retry_count: 0,
        }
    }
}

/// A generated reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Text to speak
    pub text: String,
    /// Model that produced it
    pub model: String,
    /// Attempts it took
    pub attempts: u32,
}

/// Applies the fallback policy and per-call timeout over a backend
#[derive(Clone)]
pub struct ReplyGenerator {
    backend: Arc<dyn ReplyBackend>,
    policy: FallbackPolicy,
    timeout: Duration,
}

impl ReplyGenerator {
    /// Create a generator
    #[must_use]
    pub fn new(backend: Arc<dyn ReplyBackend>, policy: FallbackPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            timeout,
        }
    }

    /// Start a request for a turn against the primary model
    #[must_use]
    pub fn request(&self, turn: u64, input_text: String) -> TurnRequest {
        TurnRequest::new(turn, input_text, &self.policy.primary)
    }

    /// Produce a reply for the turn
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy is exhausted, or the first
    /// non-retryable error
    pub async fn reply(&self, mut request: TurnRequest) -> Result<Reply> {
        let models = self.policy.models();
        let mut last_error = None;

        for (attempt, model) in models.into_iter().enumerate() {
            if attempt > 0 {
                request.retry_count += 1;
                model.clone_into(&mut request.selected_model);
                tokio::time::sleep(self.policy.backoff).await;
            }

            tracing::info!(
                turn = request.turn,
                model = %request.selected_model,
                retry = request.retry_count,
                "generating reply"
            );

            match self.attempt(&request).await {
                Ok(text) => {
                    return Ok(Reply {
                        text,
                        model: request.selected_model,
                        attempts: request.retry_count + 1,
                    });
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        turn = request.turn,
                        model = %request.selected_model,
                        error = %e,
                        "reply attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(turn = request.turn, error = %e, "reply failed, not retrying");
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Config("no reply model configured".to_string())))
    }

    async fn attempt(&self, request: &TurnRequest) -> Result<String> {
        #[allow(clippy::cast_possible_truncation)]
        let millis = self.timeout.as_millis() as u64;
        let raw = tokio::time::timeout(
            self.timeout,
            self.backend
                .generate(&request.input_text, &request.selected_model),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "reply generation",
            millis,
        })??;

        let text = clean_reply(&raw);
        if text.is_empty() {
            return Err(Error::ModelWarmingUp {
                model: request.selected_model.clone(),
                detail: "empty generated text".to_string(),
            });
        }
        Ok(text)
    }
}

/// Collapse line breaks and trim; generated text is spoken as one utterance
#[must_use]
pub fn clean_reply(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

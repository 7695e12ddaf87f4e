//! Hugging Face hosted inference backend

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::ReplyBackend;
use crate::retry::is_recoverable;
use crate::{Error, Result};

/// Response body of the text generation endpoint
///
/// Failure is tried first: an error body has no `generated_text` and would
/// otherwise match the single-object shape.
#[derive(Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Failure {
        error: String,
        #[serde(default)]
        estimated_time: Option<f64>,
    },
    Batch(Vec<Generated>),
    Single(Generated),
}

#[derive(Deserialize)]
struct Generated {
    #[serde(default)]
    generated_text: Option<String>,
}

#[derive(serde::Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

/// Generates text with models served by the hosted inference API
pub struct HuggingFaceBackend {
    client: reqwest::Client,
    token: SecretString,
    endpoint: String,
}

impl HuggingFaceBackend {
    /// Create a backend
    ///
    /// # Errors
    ///
    /// Returns error if the token is empty
    pub fn new(token: SecretString, endpoint: &str) -> Result<Self> {
        if token.expose_secret().is_empty() {
            return Err(Error::Credentials("inference token required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            token,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReplyBackend for HuggingFaceBackend {
    async fn generate(&self, text: &str, model: &str) -> Result<String> {
        let url = format!("{}/{model}", self.endpoint);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .json(&InferenceRequest { inputs: text })
            .send()
            .await
            .map_err(|e| Error::Upstream {
                model: model.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| Error::Upstream {
            model: model.to_string(),
            detail: e.to_string(),
        })?;

        tracing::debug!(model, status, bytes = body.len(), "inference response");
        parse_response(model, status, &body)
    }
}

/// Interpret an inference response
///
/// Loading models, empty output and malformed bodies are all reported as
/// `ModelWarmingUp` so the generator may try the fallback.
///
/// # Errors
///
/// Returns `ModelWarmingUp` or `Upstream` when the body holds no usable text
pub fn parse_response(model: &str, status: u16, body: &str) -> Result<String> {
    let warming = |detail: String| Error::ModelWarmingUp {
        model: model.to_string(),
        detail,
    };

    if !(200..300).contains(&status) {
        if is_recoverable(status, body) {
            return Err(warming(format!("HTTP {status}: {body}")));
        }
        tracing::error!(model, status, body, "inference API error");
        return Err(Error::Upstream {
            model: model.to_string(),
            detail: format!("HTTP {status}: {body}"),
        });
    }

    let parsed: InferenceResponse =
        serde_json::from_str(body).map_err(|e| warming(format!("malformed response: {e}")))?;

    let generated = match parsed {
        InferenceResponse::Failure {
            error,
            estimated_time,
        } => {
            let detail = match estimated_time {
                Some(secs) => format!("{error} (ready in ~{secs:.0}s)"),
                None => error,
            };
            return Err(warming(detail));
        }
        InferenceResponse::Batch(items) => items.into_iter().find_map(|g| g.generated_text),
        InferenceResponse::Single(g) => g.generated_text,
    };

    generated
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| warming("no generated text".to_string()))
}

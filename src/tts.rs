//! Text-to-speech (TTS) synthesis

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::SpeechConfig;
use crate::credentials::Credentials;
use crate::{Error, Result};

/// Produces encoded audio for a piece of text
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Synthesize `text` with `voice`
    ///
    /// # Errors
    ///
    /// Returns `Synthesis` if the service fails or returns no audio
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsProvider {
    /// `ElevenLabs` text-to-speech
    #[default]
    ElevenLabs,
    /// `OpenAI` audio speech
    OpenAi,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "elevenlabs" | "eleven_labs" => Ok(Self::ElevenLabs),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

impl TtsProvider {
    /// Default API base URL
    #[must_use]
    pub const fn default_endpoint(self) -> &'static str {
        match self {
            Self::ElevenLabs => "https://api.elevenlabs.io",
            Self::OpenAi => "https://api.openai.com",
        }
    }

    /// Default synthesis model
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::ElevenLabs => "eleven_monolingual_v1",
            Self::OpenAi => "tts-1",
        }
    }

    /// Default voices, two so turns alternate speakers
    #[must_use]
    pub fn default_voices(self) -> Vec<String> {
        let voices: &[&str] = match self {
            Self::ElevenLabs => &["21m00Tcm4TlvDq8ikWAM", "AZnzlk1XvdvUeBnXmlld"],
            Self::OpenAi => &["alloy", "echo"],
        };
        voices.iter().map(ToString::to_string).collect()
    }
}

/// Synthesizes speech over HTTP
pub struct HttpSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
    model: String,
    output_format: String,
    provider: TtsProvider,
}

impl HttpSpeech {
    /// Create a new TTS backend using `ElevenLabs`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(
        api_key: SecretString,
        endpoint: String,
        model: String,
        output_format: String,
    ) -> Result<Self> {
        Self::new(api_key, endpoint, model, output_format, TtsProvider::ElevenLabs)
    }

    /// Create a new TTS backend using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: SecretString, endpoint: String, model: String) -> Result<Self> {
        Self::new(api_key, endpoint, model, "mp3".to_string(), TtsProvider::OpenAi)
    }

    /// Create the backend selected by configuration
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(speech: &SpeechConfig, credentials: &Credentials) -> Result<Self> {
        match speech.provider {
            TtsProvider::ElevenLabs => Self::new_elevenlabs(
                credentials.require_elevenlabs()?,
                speech.endpoint.clone(),
                speech.model.clone(),
                speech.output_format.clone(),
            ),
            TtsProvider::OpenAi => Self::new_openai(
                credentials.require_openai()?,
                speech.endpoint.clone(),
                speech.model.clone(),
            ),
        }
    }

    fn new(
        api_key: SecretString,
        endpoint: String,
        model: String,
        output_format: String,
        provider: TtsProvider,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required for TTS")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            output_format,
            provider,
        })
    }

    /// Synthesize using `ElevenLabs` TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/v1/text-to-speech/{voice}", self.endpoint);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.output_format.as_str())])
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        read_audio(response, "ElevenLabs").await
    }

    /// Synthesize using `OpenAI` TTS
    async fn synthesize_openai(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: &self.output_format,
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.endpoint))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        read_audio(response, "OpenAI").await
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeech {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        match self.provider {
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice).await,
            TtsProvider::OpenAi => self.synthesize_openai(text, voice).await,
        }
    }
}

async fn read_audio(response: reqwest::Response, provider: &str) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, provider, "TTS API error");
        return Err(Error::Synthesis(format!("{provider} TTS error {status}: {body}")));
    }

    let audio = response
        .bytes()
        .await
        .map_err(|e| Error::Synthesis(e.to_string()))?;
    if audio.is_empty() {
        return Err(Error::Synthesis(format!("{provider} returned no audio")));
    }

    Ok(audio.to_vec())
}

/// Bounded-time synthesis in front of a backend
#[derive(Clone)]
pub struct SpeechSynthesizer {
    backend: Arc<dyn SpeechBackend>,
    timeout: Duration,
}

impl SpeechSynthesizer {
    /// Wrap a backend
    #[must_use]
    pub fn new(backend: Arc<dyn SpeechBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Synthesize `text` in `voice`, failing after the configured timeout
    ///
    /// # Errors
    ///
    /// Returns `Synthesis` or `Timeout`; never a transport error
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(Error::Synthesis("nothing to say".to_string()));
        }

        tracing::debug!(text, voice, "synthesizing");
        #[allow(clippy::cast_possible_truncation)]
        let millis = self.timeout.as_millis() as u64;
        let audio = tokio::time::timeout(self.timeout, self.backend.synthesize(text, voice))
            .await
            .map_err(|_| Error::Timeout {
                operation: "speech synthesis",
                millis,
            })??;

        if audio.is_empty() {
            return Err(Error::Synthesis("no audio returned".to_string()));
        }
        tracing::debug!(bytes = audio.len(), "synthesized");
        Ok(audio)
    }
}

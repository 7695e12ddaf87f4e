//! Service credentials
//!
//! Read once at startup from a JSON token file, with environment variables
//! taking precedence. Every key is held as a [`SecretString`] and never
//! logged.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{Error, Result};

/// Organisation tokens in the token file are stored without this prefix
const ORG_TOKEN_PREFIX: &str = "api_org_";

/// Token file schema
///
/// ```json
/// {"authorization": "...", "deepgram": "...", "elevenlabs": "..."}
/// ```
#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    authorization: Option<String>,
    #[serde(default)]
    deepgram: Option<String>,
    #[serde(default)]
    elevenlabs: Option<String>,
    #[serde(default)]
    openai: Option<String>,
}

/// Keys for the external services
#[derive(Debug, Default)]
pub struct Credentials {
    /// Text generation inference token
    pub inference: Option<SecretString>,
    /// Deepgram API key
    pub deepgram: Option<SecretString>,
    /// `ElevenLabs` API key
    pub elevenlabs: Option<SecretString>,
    /// `OpenAI` API key
    pub openai: Option<SecretString>,
}

impl Credentials {
    /// Load credentials from the process environment and an optional file
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::resolve(path, |key| std::env::var(key).ok())
    }

    /// Resolve credentials with an explicit environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn resolve(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match path {
            Some(path) if path.exists() => read_token_file(path)?,
            Some(path) => {
                tracing::debug!(path = %path.display(), "no token file");
                TokenFile::default()
            }
            None => TokenFile::default(),
        };

        let pick = |var: &str, from_file: Option<String>| {
            env(var)
                .filter(|v| !v.is_empty())
                .or(from_file.filter(|v| !v.is_empty()))
                .map(SecretString::from)
        };

        Ok(Self {
            inference: pick("HF_API_TOKEN", file.authorization.map(org_token)),
            deepgram: pick("DEEPGRAM_API_KEY", file.deepgram),
            elevenlabs: pick("ELEVENLABS_API_KEY", file.elevenlabs),
            openai: pick("OPENAI_API_KEY", file.openai),
        })
    }

    /// The inference token, or an error naming where to put it
    ///
    /// # Errors
    ///
    /// Returns `Credentials` if no token was found
    pub fn require_inference(&self) -> Result<SecretString> {
        require(self.inference.as_ref(), "inference token (HF_API_TOKEN or \"authorization\")")
    }

    /// The Deepgram key
    ///
    /// # Errors
    ///
    /// Returns `Credentials` if no key was found
    pub fn require_deepgram(&self) -> Result<SecretString> {
        require(self.deepgram.as_ref(), "Deepgram key (DEEPGRAM_API_KEY or \"deepgram\")")
    }

    /// The `ElevenLabs` key
    ///
    /// # Errors
    ///
    /// Returns `Credentials` if no key was found
    pub fn require_elevenlabs(&self) -> Result<SecretString> {
        require(
            self.elevenlabs.as_ref(),
            "ElevenLabs key (ELEVENLABS_API_KEY or \"elevenlabs\")",
        )
    }

    /// The `OpenAI` key
    ///
    /// # Errors
    ///
    /// Returns `Credentials` if no key was found
    pub fn require_openai(&self) -> Result<SecretString> {
        require(self.openai.as_ref(), "OpenAI key (OPENAI_API_KEY or \"openai\")")
    }
}

/// Default token file: `~/.config/voice-loop/token.json`
#[must_use]
pub fn default_token_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-loop").join("token.json"))
}

fn read_token_file(path: &Path) -> Result<TokenFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))?;
    let file = serde_json::from_str(&content)
        .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "loaded token file");
    Ok(file)
}

fn org_token(raw: String) -> String {
    if raw.is_empty() || raw.starts_with(ORG_TOKEN_PREFIX) || raw.starts_with("hf_") {
        raw
    } else {
        format!("{ORG_TOKEN_PREFIX}{raw}")
    }
}

fn require(secret: Option<&SecretString>, what: &str) -> Result<SecretString> {
    secret
        .filter(|s| !s.expose_secret().is_empty())
        .cloned()
        .ok_or_else(|| Error::Credentials(format!("missing {what}")))
}

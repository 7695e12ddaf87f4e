//! TOML configuration file loading
//!
//! Supports `~/.config/voice-loop/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! Durations are in milliseconds.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::conversation::{AgentSelection, BoundaryPolicy};
use crate::tts::TtsProvider;
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceLoopConfigFile {
    /// Path to the JSON token file
    #[serde(default)]
    pub credentials: Option<String>,

    /// Microphone capture
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Speech-to-text service
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Text generation service
    #[serde(default)]
    pub reply: ReplyFileConfig,

    /// Text-to-speech service
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Turn taking and supervision
    #[serde(default)]
    pub turn: TurnFileConfig,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub chunk_frames: Option<usize>,
    /// Chunks buffered between the device callback and the session
    pub queue_capacity: Option<usize>,
}

/// Transcription configuration
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    /// Websocket URL (e.g. "wss://api.deepgram.com/v1/listen")
    pub endpoint: Option<String>,
    /// Recognition model (e.g. "nova-2")
    pub model: Option<String>,
    /// BCP-47 language code (e.g. "en-US")
    pub language_code: Option<String>,
    pub open_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub keep_alive_interval_ms: Option<u64>,
}

/// Reply generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReplyFileConfig {
    /// Inference API base URL
    pub endpoint: Option<String>,
    /// Model asked first (e.g. "gpt2")
    pub primary_model: Option<String>,
    /// Model asked after a retryable failure; empty string disables
    pub fallback_model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub backoff_ms: Option<u64>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub provider: Option<TtsProvider>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Provider output format (e.g. "mp3_44100_128")
    pub output_format: Option<String>,
    /// Voice identifiers available to the agent roster
    pub voices: Option<Vec<String>>,
    pub selection: Option<AgentSelection>,
    pub timeout_ms: Option<u64>,
}

/// Turn configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    pub boundary: Option<BoundaryPolicy>,
    /// Sentence-terminal characters (e.g. ".?!")
    pub terminals: Option<String>,
    /// Fire the turn after this much silence following a final fragment
    pub silence_timeout_ms: Option<u64>,
    /// Stop feeding audio while a turn is processed and spoken
    pub suppress_capture: Option<bool>,
    pub max_session_restarts: Option<u32>,
    pub restart_base_delay_ms: Option<u64>,
    /// Stop after this many completed turns
    pub max_turns: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceLoopConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceLoopConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceLoopConfigFile::default();
    };

    if !path.exists() {
        return VoiceLoopConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoiceLoopConfigFile::default()
        }
    }
}

/// Read and parse a specific config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<VoiceLoopConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/voice-loop/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-loop").join("config.toml"))
}

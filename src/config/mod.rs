//! Configuration management for the dialogue loop
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conversation::{AgentSelection, BoundaryPolicy, DEFAULT_TERMINALS};
use crate::retry::{FallbackPolicy, RetryPolicy};
use crate::stt::SessionParams;
use crate::tts::TtsProvider;
use crate::voice::{AudioFormat, CHUNK_FRAMES, SAMPLE_RATE};
use crate::{Error, Result};

use file::VoiceLoopConfigFile;

/// Dialogue loop configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the JSON token file
    pub credentials_path: Option<PathBuf>,

    /// Microphone capture
    pub audio: AudioConfig,

    /// Speech-to-text service
    pub transcription: TranscriptionConfig,

    /// Text generation service
    pub reply: ReplyConfig,

    /// Text-to-speech service
    pub speech: SpeechConfig,

    /// Turn taking and supervision
    pub turn: TurnConfig,
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Format of captured chunks
    pub format: AudioFormat,

    /// Chunks buffered between the device callback and the session
    pub queue_capacity: usize,
}

/// Transcription configuration
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Websocket endpoint
    pub endpoint: String,

    /// Recognition model
    pub model: String,

    /// BCP-47 language code
    pub language_code: String,

    /// Budget for opening a session
    pub open_timeout: Duration,

    /// Budget for draining fragments after end-of-stream
    pub drain_timeout: Duration,

    /// Interval between keep-alives while capture is suppressed
    pub keep_alive_interval: Duration,
}

/// Reply generation configuration
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// Inference API base URL
    pub endpoint: String,

    /// Model asked first
    pub primary_model: String,

    /// Model asked after a retryable failure
    pub fallback_model: Option<String>,

    /// Budget per generation call
    pub timeout: Duration,

    /// Pause before the fallback attempt
    pub backoff: Duration,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Synthesis service
    pub provider: TtsProvider,

    /// API base URL
    pub endpoint: String,

    /// Synthesis model
    pub model: String,

    /// Output format requested from `ElevenLabs`
    pub output_format: String,

    /// Voices the roster picks from
    pub voices: Vec<String>,

    /// How the roster picks
    pub selection: AgentSelection,

    /// Budget per synthesis call
    pub timeout: Duration,
}

/// Turn configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Signals that end a turn
    pub boundary: BoundaryPolicy,

    /// Sentence-terminal characters
    pub terminals: Vec<char>,

    /// Fire a turn after this much silence following a final fragment
    pub silence_timeout: Option<Duration>,

    /// Stop feeding audio while a turn is processed and spoken
    pub suppress_capture: bool,

    /// Session restarts allowed per run
    pub max_session_restarts: u32,

    /// Base of the exponential backoff between restarts
    pub restart_base_delay: Duration,

    /// Stop after this many completed turns
    pub max_turns: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_layers(VoiceLoopConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// `VOICE_LOOP_CONFIG` names a config file to use instead of the
    /// standard path.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is unreadable or the
    /// resolved values are invalid
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("VOICE_LOOP_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load configuration, reading `path` instead of the standard file
    ///
    /// Unlike the standard file, an explicit path must exist and parse.
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable or the resolved values are
    /// invalid
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        let config = Self::from_layers(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Resolve a config file overlay and an environment lookup over defaults
    #[must_use]
    pub fn from_layers(fc: VoiceLoopConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());
        let ms = Duration::from_millis;

        let credentials_path = env("VOICE_LOOP_CREDENTIALS")
            .or(fc.credentials)
            .map(PathBuf::from)
            .or_else(crate::credentials::default_token_path);

        // Audio (toml > default)
        let audio = AudioConfig {
            format: AudioFormat {
                sample_rate: fc.audio.sample_rate.unwrap_or(SAMPLE_RATE),
                channels: fc.audio.channels.unwrap_or(1),
                bit_depth: 16,
                chunk_frames: fc.audio.chunk_frames.unwrap_or(CHUNK_FRAMES),
            },
            queue_capacity: fc.audio.queue_capacity.unwrap_or(64),
        };

        // Transcription (env > toml > default)
        let transcription = TranscriptionConfig {
            endpoint: fc
                .transcription
                .endpoint
                .unwrap_or_else(|| "wss://api.deepgram.com/v1/listen".to_string()),
            model: env("VOICE_LOOP_STT_MODEL")
                .or(fc.transcription.model)
                .unwrap_or_else(|| "nova-2".to_string()),
            language_code: env("VOICE_LOOP_LANGUAGE")
                .or(fc.transcription.language_code)
                .unwrap_or_else(|| "en-US".to_string()),
            open_timeout: ms(fc.transcription.open_timeout_ms.unwrap_or(10_000)),
            drain_timeout: ms(fc.transcription.drain_timeout_ms.unwrap_or(2_000)),
            keep_alive_interval: ms(fc.transcription.keep_alive_interval_ms.unwrap_or(5_000)),
        };

        // Reply (env > toml > default); an empty fallback disables it
        let reply = ReplyConfig {
            endpoint: fc
                .reply
                .endpoint
                .unwrap_or_else(|| "https://api-inference.huggingface.co/models".to_string()),
            primary_model: env("VOICE_LOOP_PRIMARY_MODEL")
                .or(fc.reply.primary_model)
                .unwrap_or_else(|| "gpt2".to_string()),
            fallback_model: env("VOICE_LOOP_FALLBACK_MODEL")
                .or(fc.reply.fallback_model)
                .or_else(|| Some("distilgpt2".to_string()))
                .filter(|m| !m.is_empty()),
            timeout: ms(fc.reply.timeout_ms.unwrap_or(30_000)),
            backoff: ms(fc.reply.backoff_ms.unwrap_or(500)),
        };

        // Speech (env > toml > provider default)
        let provider = env("VOICE_LOOP_TTS_PROVIDER")
            .and_then(|p| match p.parse() {
                Ok(provider) => Some(provider),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring VOICE_LOOP_TTS_PROVIDER");
                    None
                }
            })
            .or(fc.speech.provider)
            .unwrap_or_default();
        let voices = env("VOICE_LOOP_VOICES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .or(fc.speech.voices)
            .unwrap_or_else(|| provider.default_voices());
        let speech = SpeechConfig {
            provider,
            endpoint: fc
                .speech
                .endpoint
                .unwrap_or_else(|| provider.default_endpoint().to_string()),
            model: fc
                .speech
                .model
                .unwrap_or_else(|| provider.default_model().to_string()),
            output_format: fc
                .speech
                .output_format
                .unwrap_or_else(|| "mp3_44100_128".to_string()),
            voices,
            selection: fc.speech.selection.unwrap_or_default(),
            timeout: ms(fc.speech.timeout_ms.unwrap_or(30_000)),
        };

        // Turn (env > toml > default)
        let retry_defaults = RetryPolicy::default();
        let turn = TurnConfig {
            boundary: fc.turn.boundary.unwrap_or_default(),
            terminals: fc
                .turn
                .terminals
                .map_or_else(|| DEFAULT_TERMINALS.to_vec(), |t| t.chars().collect()),
            silence_timeout: env_parse("VOICE_LOOP_SILENCE_TIMEOUT_MS")
                .or(fc.turn.silence_timeout_ms)
                .filter(|&t| t > 0)
                .map(ms),
            suppress_capture: fc.turn.suppress_capture.unwrap_or(true),
            max_session_restarts: fc
                .turn
                .max_session_restarts
                .unwrap_or(retry_defaults.max_retries),
            restart_base_delay: fc
                .turn
                .restart_base_delay_ms
                .map_or(retry_defaults.base_delay, ms),
            max_turns: env_parse("VOICE_LOOP_MAX_TURNS").or(fc.turn.max_turns),
        };

        Self {
            credentials_path,
            audio,
            transcription,
            reply,
            speech,
            turn,
        }
    }

    /// Reject values the loop cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid value
    pub fn validate(&self) -> Result<()> {
        let format = &self.audio.format;
        if format.sample_rate == 0 || format.channels == 0 || format.chunk_frames == 0 {
            return Err(Error::Config(
                "audio sample_rate, channels and chunk_frames must be positive".to_string(),
            ));
        }
        if self.audio.queue_capacity == 0 {
            return Err(Error::Config("audio queue_capacity must be positive".to_string()));
        }
        if self.reply.primary_model.trim().is_empty() {
            return Err(Error::Config("reply primary_model must be set".to_string()));
        }
        if self.speech.voices.is_empty() {
            return Err(Error::Config("at least one speech voice required".to_string()));
        }
        if self.turn.terminals.is_empty() {
            return Err(Error::Config("turn terminals must not be empty".to_string()));
        }
        Ok(())
    }

    /// Parameters for opening transcription sessions
    #[must_use]
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            language_code: self.transcription.language_code.clone(),
            sample_rate: self.audio.format.sample_rate,
            channels: self.audio.format.channels,
            encoding: "linear16".to_string(),
        }
    }

    /// Model policy for reply generation
    #[must_use]
    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            primary: self.reply.primary_model.clone(),
            fallback: self.reply.fallback_model.clone(),
            backoff: self.reply.backoff,
        }
    }

    /// Backoff between transcription session restarts
    #[must_use]
    pub fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.turn.max_session_restarts,
            base_delay: self.turn.restart_base_delay,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn overlay(toml_text: &str) -> VoiceLoopConfigFile {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn defaults_match_reference_setup() {
        let config = Config::from_layers(VoiceLoopConfigFile::default(), env(&[]));

        assert_eq!(config.audio.format.sample_rate, 16_000);
        assert_eq!(config.audio.format.chunk_bytes(), 2048);
        assert_eq!(config.reply.primary_model, "gpt2");
        assert_eq!(config.reply.fallback_model.as_deref(), Some("distilgpt2"));
        assert_eq!(config.speech.provider, TtsProvider::ElevenLabs);
        assert_eq!(config.speech.voices.len(), 2);
        assert_eq!(config.turn.boundary, BoundaryPolicy::FinalPunctuation);
        assert!(config.turn.suppress_capture);
        assert_eq!(config.turn.max_session_restarts, 5);
        assert!(config.turn.silence_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_beats_file_beats_default() {
        let fc = overlay(
            r#"
            [reply]
            primary_model = "from-file"
            fallback_model = "file-fallback"

            [transcription]
            language_code = "de-DE"
            "#,
        );
        let config = Config::from_layers(fc, env(&[("VOICE_LOOP_PRIMARY_MODEL", "from-env")]));

        assert_eq!(config.reply.primary_model, "from-env");
        assert_eq!(config.reply.fallback_model.as_deref(), Some("file-fallback"));
        assert_eq!(config.transcription.language_code, "de-DE");
        assert_eq!(config.transcription.model, "nova-2");
    }

    #[test]
    fn empty_fallback_disables_it() {
        let fc = overlay("[reply]\nfallback_model = \"\"\n");
        let config = Config::from_layers(fc, env(&[]));
        assert!(config.reply.fallback_model.is_none());
        assert_eq!(config.fallback_policy().max_attempts(), 1);
    }

    #[test]
    fn provider_switch_changes_voice_defaults() {
        let config = Config::from_layers(
            VoiceLoopConfigFile::default(),
            env(&[("VOICE_LOOP_TTS_PROVIDER", "openai")]),
        );
        assert_eq!(config.speech.provider, TtsProvider::OpenAi);
        assert_eq!(config.speech.endpoint, "https://api.openai.com");
        assert_eq!(config.speech.voices, vec!["alloy", "echo"]);
    }

    #[test]
    fn voices_from_env_list() {
        let config = Config::from_layers(
            VoiceLoopConfigFile::default(),
            env(&[("VOICE_LOOP_VOICES", "rachel, domi ,")]),
        );
        assert_eq!(config.speech.voices, vec!["rachel", "domi"]);
    }

    #[test]
    fn durations_read_as_milliseconds() {
        let fc = overlay(
            r#"
            [turn]
            silence_timeout_ms = 1200
            restart_base_delay_ms = 10
            max_session_restarts = 2
            terminals = ".?"
            "#,
        );
        let config = Config::from_layers(fc, env(&[]));

        assert_eq!(config.turn.silence_timeout, Some(Duration::from_millis(1200)));
        assert_eq!(config.turn.terminals, vec!['.', '?']);
        let policy = config.restart_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn zero_silence_timeout_means_disabled() {
        let config = Config::from_layers(
            VoiceLoopConfigFile::default(),
            env(&[("VOICE_LOOP_SILENCE_TIMEOUT_MS", "0")]),
        );
        assert!(config.turn.silence_timeout.is_none());
    }

    #[test]
    fn invalid_values_rejected() {
        let fc = overlay("[audio]\nqueue_capacity = 0\n");
        assert!(Config::from_layers(fc, env(&[])).validate().is_err());

        let fc = overlay("[speech]\nvoices = []\n");
        assert!(Config::from_layers(fc, env(&[])).validate().is_err());

        let fc = overlay("[turn]\nterminals = \"\"\n");
        assert!(Config::from_layers(fc, env(&[])).validate().is_err());
    }

    #[test]
    fn session_params_follow_audio_format() {
        let config = Config::default();
        let params = config.session_params();
        assert_eq!(params.sample_rate, 16_000);
        assert_eq!(params.channels, 1);
        assert_eq!(params.encoding, "linear16");
    }
}

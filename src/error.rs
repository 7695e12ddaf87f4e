//! Error types for the dialogue loop

use thiserror::Error;

/// Result type alias for dialogue loop operations
pub type Result<T> = std::result::Result<T, Error>;

/// How far an error reaches
///
/// Every error the orchestrator sees is mapped to one of these before it
/// decides what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged and retried, or the loop moves past the failed step
    Transient,
    /// The current turn is abandoned; the loop returns to listening
    TurnFatal,
    /// The run terminates with a reported error
    ProcessFatal,
}

/// Errors that can occur in the dialogue loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Credentials missing or unreadable
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// The active transcription session can no longer be used and must be reopened
    #[error("transcription session broken: {0}")]
    SessionBroken(String),

    /// Session restarts exceeded the configured maximum
    #[error("transcription session restarted {restarts} times, giving up")]
    RestartsExhausted {
        /// Restarts performed before giving up
        restarts: u32,
    },

    /// Text generation model is loading or returned no usable text
    #[error("model {model} warming up: {detail}")]
    ModelWarmingUp {
        /// Model identifier
        model: String,
        /// Upstream message
        detail: String,
    },

    /// Text generation failed for a reason retrying will not fix
    #[error("upstream error from {model}: {detail}")]
    Upstream {
        /// Model identifier
        model: String,
        /// Upstream message
        detail: String,
    },

    /// Text-to-speech error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// A network call exceeded its time budget
    #[error("{operation} timed out after {millis}ms")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// Budget in milliseconds
        millis: u64,
    },

    /// Illegal conversation phase transition
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        /// Phase the state was in
        from: crate::conversation::Phase,
        /// Phase that was requested
        to: crate::conversation::Phase,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Classify the error for the orchestrator
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::SessionBroken(_)
            | Self::Stt(_)
            | Self::ModelWarmingUp { .. }
            | Self::Timeout { .. }
            | Self::Playback(_) => ErrorClass::Transient,
            Self::Upstream { .. } | Self::Synthesis(_) | Self::InvalidTransition { .. } => {
                ErrorClass::TurnFatal
            }
            Self::Config(_)
            | Self::Credentials(_)
            | Self::Audio(_)
            | Self::RestartsExhausted { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Toml(_) => ErrorClass::ProcessFatal,
        }
    }

    /// Whether another attempt (possibly against a fallback) may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelWarmingUp { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warming_up_is_transient_and_retryable() {
        let err = Error::ModelWarmingUp {
            model: "gpt2".to_string(),
            detail: "loading".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn upstream_abandons_turn_without_retry() {
        let err = Error::Upstream {
            model: "gpt2".to_string(),
            detail: "bad request".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::TurnFatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn restart_exhaustion_is_process_fatal() {
        let err = Error::RestartsExhausted { restarts: 5 };
        assert_eq!(err.class(), ErrorClass::ProcessFatal);
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn broken_session_reopens_but_device_loss_ends_run() {
        assert_eq!(
            Error::SessionBroken("DATA-0000".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::Audio("device gone".to_string()).class(),
            ErrorClass::ProcessFatal
        );
    }
}

//! Voice Loop - a spoken dialogue loop
//!
//! Listens on the microphone, streams audio to a speech-to-text service,
//! decides when the speaker finished a turn, asks a text generation model
//! for a reply, speaks it, and listens again.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  chunks  ┌───────────────┐  fragments  ┌──────────────────┐
//! │ Microphone ├─────────►│ Transcription ├────────────►│ TurnOrchestrator │
//! └────────────┘          │    session    │             │  (Conversation   │
//!       ▲                 └───────────────┘             │     State)       │
//!       │ suppressed while speaking                     └────────┬─────────┘
//!       │                                                        │ turn
//! ┌─────┴──────┐   audio  ┌───────────────┐    text     ┌────────▼─────────┐
//! │  Speaker   │◄─────────┤  Synthesizer  │◄────────────┤  ReplyGenerator  │
//! └────────────┘          └───────────────┘             └──────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod reply;
pub mod retry;
pub mod stt;
pub mod tts;
pub mod voice;

pub use config::Config;
pub use conversation::{ConversationState, Phase, Snapshot, StatusEvent, TurnOutcome};
pub use credentials::Credentials;
pub use error::{Error, ErrorClass, Result};
pub use orchestrator::{OrchestratorSettings, RunReport, StopReason, TurnOrchestrator, TurnPipeline};
pub use reply::{Reply, ReplyBackend, ReplyGenerator, TurnRequest};
pub use stt::{Transcriber, TranscriptFragment, TranscriptionSession};
pub use tts::{SpeechBackend, SpeechSynthesizer};
pub use voice::{AudioChunk, AudioSource, MicrophoneSource, Player, SpeakerPlayer};

//! Conversation state shared by the orchestrator's tasks
//!
//! `ConversationState` is a cloneable handle over a single mutex. Every
//! mutation goes through a method that validates the phase transition it
//! implies, so concurrent tasks can hold the handle without being able to
//! advance the phase behind each other's back. The lock is never held
//! across an `.await`.

mod agent;
mod turn;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::stt::TranscriptFragment;
use crate::{Error, Result};

pub use agent::{AgentRoster, AgentSelection};
pub use turn::{BoundaryPolicy, DEFAULT_TERMINALS, Transcript, TurnDetector};

/// Capacity of the status event channel
const STATUS_CHANNEL_SIZE: usize = 256;

/// Turn phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No transcription session opened yet, or the run has ended
    Idle,
    /// Accepting speech
    Listening,
    /// Generating a reply
    Processing,
    /// Synthesizing and playing a reply
    Speaking,
}

impl Phase {
    /// Whether moving from `self` to `next` is legal
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Listening, Self::Listening)
                | (Self::Listening, Self::Processing)
                | (Self::Processing, Self::Speaking)
                | (Self::Processing | Self::Speaking, Self::Listening)
                | (_, Self::Idle)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Reply generated, synthesized and played
    Spoken,
    /// Reply generated but synthesis or playback failed
    SpeechFailed {
        /// Failure description
        reason: String,
    },
    /// No reply could be generated
    Abandoned {
        /// Failure description
        reason: String,
    },
}

/// Progress notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Phase changed
    PhaseChanged {
        /// Previous phase
        from: Phase,
        /// New phase
        to: Phase,
    },
    /// A fragment was accepted
    Heard {
        /// Fragment text
        text: String,
        /// Service marked it final
        is_final: bool,
    },
    /// A fragment arrived outside Listening and was discarded
    FragmentDropped {
        /// Fragment text
        text: String,
        /// Phase at arrival
        phase: Phase,
    },
    /// A turn boundary fired
    TurnStarted {
        /// Turn number, from 1
        turn: u64,
        /// Text handed to the reply generator
        text: String,
    },
    /// A reply is about to be spoken
    Speaking {
        /// Turn number
        turn: u64,
        /// Reply text
        text: String,
        /// Voice speaking it
        voice: Option<String>,
    },
    /// A turn ended
    TurnFinished {
        /// Turn number
        turn: u64,
        /// Outcome
        outcome: TurnOutcome,
    },
    /// The transcription session is being reopened
    SessionRestarted {
        /// Restarts so far in this run
        restarts: u32,
        /// Why the previous session ended
        reason: String,
    },
}

/// Result of offering a fragment to the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Accepted into the transcript
    Heard,
    /// Discarded; the state was not Listening
    Dropped,
    /// Accepted and closed the turn; the state is now Processing
    Boundary {
        /// Turn number
        turn: u64,
        /// Accumulated text of the turn
        text: String,
    },
}

/// Consistent view of the state, taken under one lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase
    pub phase: Phase,
    /// Speech accumulated in the current turn
    pub last_heard: String,
    /// Reply being spoken
    pub last_said: String,
    /// Voice selected for the current turn
    pub active_agent: Option<String>,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    transcript: Transcript,
    last_said: String,
    active_agent: Option<String>,
    turn: u64,
    dropped_fragments: u64,
}

impl Inner {
    fn reset_turn(&mut self) {
        self.transcript.clear();
        self.last_said.clear();
        self.active_agent = None;
    }
}

/// Shared handle to the conversation state
#[derive(Debug, Clone)]
pub struct ConversationState {
    inner: Arc<Mutex<Inner>>,
    detector: Arc<TurnDetector>,
    suppress_capture: bool,
    events: broadcast::Sender<StatusEvent>,
}

impl ConversationState {
    /// Create idle state
    ///
    /// With `suppress_capture`, audio is only forwarded while Listening.
    #[must_use]
    pub fn new(detector: TurnDetector, suppress_capture: bool) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Idle,
                transcript: Transcript::default(),
                last_said: String::new(),
                active_agent: None,
                turn: 0,
                dropped_fragments: 0,
            })),
            detector: Arc::new(detector),
            suppress_capture,
            events,
        }
    }

    /// Subscribe to status events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Consistent copy of all fields
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            phase: inner.phase,
            last_heard: inner.transcript.text(),
            last_said: inner.last_said.clone(),
            active_agent: inner.active_agent.clone(),
        }
    }

    /// Fragments discarded because they arrived outside Listening
    #[must_use]
    pub fn dropped_fragments(&self) -> u64 {
        self.lock().dropped_fragments
    }

    /// Whether captured audio should be forwarded to transcription
    #[must_use]
    pub fn capture_enabled(&self) -> bool {
        match self.lock().phase {
            Phase::Listening => true,
            Phase::Idle => false,
            Phase::Processing | Phase::Speaking => !self.suppress_capture,
        }
    }

    /// Enter Listening once a session is open
    ///
    /// A turn still in progress is discarded, so the next turn starts empty.
    ///
    /// # Errors
    ///
    /// Returns error if the phase cannot move to Listening
    pub fn start_listening(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Listening => return Ok(()),
            Phase::Processing | Phase::Speaking => {
                tracing::warn!(turn = inner.turn, phase = %inner.phase, "turn discarded");
                inner.reset_turn();
            }
            Phase::Idle => {}
        }
        self.transition(&mut inner, Phase::Listening)
    }

    /// Offer a fragment
    ///
    /// Outside Listening the fragment is dropped and counted. Inside, it is
    /// folded into the transcript; if it closes the turn the state moves to
    /// Processing in the same critical section.
    pub fn observe(&self, fragment: &TranscriptFragment) -> Observation {
        let mut inner = self.lock();

        if inner.phase != Phase::Listening {
            inner.dropped_fragments += 1;
            tracing::debug!(phase = %inner.phase, text = %fragment.text, "fragment dropped");
            self.emit(StatusEvent::FragmentDropped {
                text: fragment.text.clone(),
                phase: inner.phase,
            });
            return Observation::Dropped;
        }

        inner.transcript.apply(fragment);
        self.emit(StatusEvent::Heard {
            text: fragment.text.clone(),
            is_final: fragment.is_final,
        });

        if self.detector.is_boundary(fragment, &inner.transcript) {
            self.fire_boundary(&mut inner)
        } else {
            Observation::Heard
        }
    }

    /// Close the turn after silence, if the last fragment was final
    pub fn silence_elapsed(&self) -> Option<Observation> {
        let mut inner = self.lock();
        if inner.phase != Phase::Listening
            || inner.transcript.is_empty()
            || !inner.transcript.ends_with_final()
        {
            return None;
        }

        tracing::debug!("silence timeout closed the turn");
        Some(self.fire_boundary(&mut inner))
    }

    /// Record the voice chosen for the current turn
    ///
    /// # Errors
    ///
    /// Returns error unless Processing
    pub fn assign_agent(&self, voice: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != Phase::Processing {
            return Err(Error::InvalidTransition {
                from: inner.phase,
                to: Phase::Processing,
            });
        }
        inner.active_agent = Some(voice.to_string());
        Ok(())
    }

    /// Move from Processing to Speaking with `reply` as the text being said
    ///
    /// # Errors
    ///
    /// Returns error unless Processing
    pub fn begin_speaking(&self, reply: &str) -> Result<()> {
        let mut inner = self.lock();
        self.transition(&mut inner, Phase::Speaking)?;
        reply.clone_into(&mut inner.last_said);
        self.emit(StatusEvent::Speaking {
            turn: inner.turn,
            text: reply.to_string(),
            voice: inner.active_agent.clone(),
        });
        Ok(())
    }

    /// End the current turn and return to Listening
    ///
    /// Clears what was heard and said so the next turn starts empty.
    ///
    /// # Errors
    ///
    /// Returns error unless Processing or Speaking
    pub fn finish_turn(&self, outcome: TurnOutcome) -> Result<()> {
        let mut inner = self.lock();
        self.transition(&mut inner, Phase::Listening)?;
        inner.reset_turn();
        self.emit(StatusEvent::TurnFinished {
            turn: inner.turn,
            outcome,
        });
        Ok(())
    }

    /// Return to Idle, discarding anything in flight
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.phase == Phase::Idle {
            return;
        }
        inner.reset_turn();
        // Idle is reachable from every phase
        let _ = self.transition(&mut inner, Phase::Idle);
    }

    /// Publish a session restart notice
    pub fn session_restarted(&self, restarts: u32, reason: String) {
        self.emit(StatusEvent::SessionRestarted { restarts, reason });
    }

    fn fire_boundary(&self, inner: &mut Inner) -> Observation {
        let text = inner.transcript.text();
        inner.turn += 1;
        let turn = inner.turn;
        // Listening -> Processing is always legal here
        let _ = self.transition(inner, Phase::Processing);
        self.emit(StatusEvent::TurnStarted {
            turn,
            text: text.clone(),
        });
        Observation::Boundary { turn, text }
    }

    fn transition(&self, inner: &mut Inner, to: Phase) -> Result<()> {
        let from = inner.phase;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        inner.phase = to;
        tracing::info!(%from, %to, "phase changed");
        self.emit(StatusEvent::PhaseChanged { from, to });
        Ok(())
    }

    // Sending on a broadcast channel never blocks, so this is safe under the lock
    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Turn orchestration
//!
//! The orchestrator owns one transcription session at a time. Inside a
//! session two futures run side by side:
//!
//! - the feeder moves captured chunks into the session while the
//!   conversation is listening, and keeps the session alive otherwise
//! - the consumer folds fragments into the conversation state and, when a
//!   turn boundary fires, runs the turn (reply, synthesis, playback) inline
//!   while still draining the fragment stream
//!
//! Both futures live in one scope that is left before the next session is
//! opened, so two sessions never overlap. When a session breaks or closes
//! the orchestrator reopens it with backoff, up to the configured number
//! of restarts per run.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::conversation::{
    AgentRoster, ConversationState, Observation, TurnDetector, TurnOutcome,
};
use crate::credentials::Credentials;
use crate::reply::{HuggingFaceBackend, ReplyGenerator};
use crate::retry::{RetryPolicy, delay_for_attempt};
use crate::stt::{
    DeepgramTranscriber, SessionParams, SessionReader, SessionWriter, Transcriber,
    TranscriptionSession,
};
use crate::tts::{HttpSpeech, SpeechSynthesizer};
use crate::voice::{AudioSource, CaptureStatus, Player, SpeakerPlayer};
use crate::{Error, ErrorClass, Result};

/// Why a run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The cancellation token fired
    #[default]
    Cancelled,
    /// The configured number of turns completed
    MaxTurns,
    /// The audio source closed
    SourceClosed,
}

/// Summary of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Turns whose reply was played
    pub turns_spoken: u64,
    /// Turns whose reply could not be synthesized or played
    pub turns_speech_failed: u64,
    /// Turns with no reply
    pub turns_abandoned: u64,
    /// Transcription sessions reopened
    pub session_restarts: u32,
    /// Fragments discarded outside Listening
    pub dropped_fragments: u64,
    /// Chunks lost to capture overruns
    pub dropped_chunks: u64,
    /// Chunks withheld from transcription while a turn ran
    pub suppressed_chunks: u64,
    /// How the run ended
    pub stop_reason: StopReason,
}

impl RunReport {
    /// Turns that reached a terminal outcome
    #[must_use]
    pub const fn turns_completed(&self) -> u64 {
        self.turns_spoken + self.turns_speech_failed + self.turns_abandoned
    }

    fn record(&mut self, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Spoken => self.turns_spoken += 1,
            TurnOutcome::SpeechFailed { .. } => self.turns_speech_failed += 1,
            TurnOutcome::Abandoned { .. } => self.turns_abandoned += 1,
        }
    }
}

/// Timing and limits for a run
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Parameters for every session opened
    pub session: SessionParams,
    /// Fire a turn after this much silence following a final fragment
    pub silence_timeout: Option<Duration>,
    /// Budget for draining fragments after end-of-stream
    pub drain_timeout: Duration,
    /// Interval between keep-alives while capture is suppressed
    pub keep_alive_interval: Duration,
    /// Session restart bound and backoff
    pub restart_policy: RetryPolicy,
    /// Stop after this many completed turns
    pub max_turns: Option<u64>,
}

impl OrchestratorSettings {
    /// Settings from resolved configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: config.session_params(),
            silence_timeout: config.turn.silence_timeout,
            drain_timeout: config.transcription.drain_timeout,
            keep_alive_interval: config.transcription.keep_alive_interval,
            restart_policy: config.restart_policy(),
            max_turns: config.turn.max_turns,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What a turn needs once its boundary has fired
pub struct TurnPipeline {
    /// Produces the reply text
    pub generator: ReplyGenerator,
    /// Turns the reply into audio
    pub synthesizer: SpeechSynthesizer,
    /// Picks the voice
    pub roster: AgentRoster,
    /// Plays the audio to completion
    pub player: Box<dyn Player>,
}

impl TurnPipeline {
    /// Run one turn from Processing to the point it can return to Listening
    async fn run(&mut self, state: &ConversationState, turn: u64, heard: String) -> TurnOutcome {
        let voice = self.roster.pick().to_string();
        if let Err(e) = state.assign_agent(&voice) {
            return TurnOutcome::Abandoned {
                reason: e.to_string(),
            };
        }

        let reply = match self.generator.reply(self.generator.request(turn, heard)).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(turn, error = %e, "no reply, turn abandoned");
                return TurnOutcome::Abandoned {
                    reason: e.to_string(),
                };
            }
        };

        if let Err(e) = state.begin_speaking(&reply.text) {
            return TurnOutcome::Abandoned {
                reason: e.to_string(),
            };
        }
        tracing::info!(
            turn,
            said = %reply.text,
            model = %reply.model,
            attempts = reply.attempts,
            voice = %voice,
            "speaking"
        );

        let spoken = match self.synthesizer.synthesize(&reply.text, &voice).await {
            Ok(audio) => self.player.play(&audio).await,
            Err(e) => Err(e),
        };

        match spoken {
            Ok(()) => TurnOutcome::Spoken,
            Err(e) => {
                tracing::warn!(turn, error = %e, "reply not spoken");
                TurnOutcome::SpeechFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// How a session scope ended
enum SessionEnd {
    /// Asked to stop; the session was drained
    Stopped,
    /// The service closed the stream on its own
    Closed,
    /// A collaborator failed
    Failed(Error),
}

/// How the feeder ended without error
enum FeedEnd {
    /// Asked to stop; end-of-stream was sent
    Stopped,
    /// The audio source has no more chunks; end-of-stream was sent
    SourceClosed,
}

/// Drives the listen, reply, speak cycle
pub struct TurnOrchestrator {
    transcriber: Arc<dyn Transcriber>,
    pipeline: TurnPipeline,
    state: ConversationState,
    settings: OrchestratorSettings,
}

impl TurnOrchestrator {
    /// Assemble an orchestrator from its collaborators
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        pipeline: TurnPipeline,
        state: ConversationState,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            transcriber,
            pipeline,
            state,
            settings,
        }
    }

    /// Build the production orchestrator: Deepgram, hosted inference,
    /// HTTP speech and the default speaker
    ///
    /// # Errors
    ///
    /// Returns error if a credential is missing or a device is unavailable
    pub fn from_config(config: &Config, credentials: &Credentials) -> Result<Self> {
        let transcriber = DeepgramTranscriber::new(
            credentials.require_deepgram()?,
            &config.transcription.endpoint,
            config.transcription.model.clone(),
            config.transcription.open_timeout,
        )?;

        let generator = ReplyGenerator::new(
            Arc::new(HuggingFaceBackend::new(
                credentials.require_inference()?,
                &config.reply.endpoint,
            )?),
            config.fallback_policy(),
            config.reply.timeout,
        );

        let synthesizer = SpeechSynthesizer::new(
            Arc::new(HttpSpeech::from_config(&config.speech, credentials)?),
            config.speech.timeout,
        );
        let roster = AgentRoster::new(config.speech.voices.clone(), config.speech.selection)?;

        let state = ConversationState::new(
            TurnDetector::new(config.turn.boundary, config.turn.terminals.clone()),
            config.turn.suppress_capture,
        );

        Ok(Self::new(
            Arc::new(transcriber),
            TurnPipeline {
                generator,
                synthesizer,
                roster,
                player: Box::new(SpeakerPlayer::new()?),
            },
            state,
            OrchestratorSettings::from_config(config),
        ))
    }

    /// Handle to the conversation state
    #[must_use]
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Run until `cancel` fires, the turn limit is reached or the source closes
    ///
    /// # Errors
    ///
    /// Returns `RestartsExhausted` once session restarts run out, or any
    /// process-fatal collaborator error (device failure, bad credentials)
    pub async fn run<S>(&mut self, source: &mut S, cancel: CancellationToken) -> Result<RunReport>
    where
        S: AudioSource + ?Sized,
    {
        let policy = self.settings.restart_policy.clone();
        let mut report = RunReport::default();
        let mut restarts = 0u32;

        let outcome = loop {
            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(StopReason::Cancelled),
                opened = self.transcriber.open(&self.settings.session) => opened,
            };

            let end = match opened {
                Ok(session) => {
                    tracing::info!(session = session.id(), "transcription session open");
                    if let Err(e) = self.state.start_listening() {
                        break Err(e);
                    }
                    self.run_session(session, source, &cancel, &mut report).await
                }
                Err(e) => SessionEnd::Failed(e),
            };

            let reason = match end {
                SessionEnd::Stopped => break Ok(self.stop_reason(&cancel, &report)),
                SessionEnd::Closed => "closed by service".to_string(),
                SessionEnd::Failed(e) => match e.class() {
                    ErrorClass::Transient => e.to_string(),
                    ErrorClass::TurnFatal | ErrorClass::ProcessFatal => {
                        tracing::error!(
                            error = %e,
                            class = ?e.class(),
                            "conversation cannot continue"
                        );
                        break Err(e);
                    }
                },
            };

            if restarts >= policy.max_retries {
                tracing::error!(
                    restarts,
                    reason = %reason,
                    "transcription session restarts exhausted"
                );
                break Err(Error::RestartsExhausted { restarts });
            }

            let delay = delay_for_attempt(&policy, restarts);
            restarts += 1;
            report.session_restarts = restarts;
            tracing::warn!(
                restarts,
                delay_ms = delay.as_millis(),
                reason = %reason,
                "reopening transcription session"
            );
            self.state.session_restarted(restarts, reason);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(StopReason::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        };

        self.state.stop();
        report.dropped_fragments = self.state.dropped_fragments();
        report.dropped_chunks = source.dropped_chunks();
        report.stop_reason = outcome?;

        tracing::info!(
            spoken = report.turns_spoken,
            abandoned = report.turns_abandoned,
            restarts = report.session_restarts,
            dropped_fragments = report.dropped_fragments,
            stop = ?report.stop_reason,
            "conversation ended"
        );
        Ok(report)
    }

    fn stop_reason(&self, cancel: &CancellationToken, report: &RunReport) -> StopReason {
        if cancel.is_cancelled() {
            StopReason::Cancelled
        } else if self
            .settings
            .max_turns
            .is_some_and(|max| report.turns_completed() >= max)
        {
            StopReason::MaxTurns
        } else {
            StopReason::SourceClosed
        }
    }

    /// Feed and consume one session until it ends
    async fn run_session<S>(
        &mut self,
        session: TranscriptionSession,
        source: &mut S,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> SessionEnd
    where
        S: AudioSource + ?Sized,
    {
        let (mut writer, mut reader) = session.split();
        let stop = cancel.child_token();
        let feed_failed = CancellationToken::new();
        let state = self.state.clone();
        let keep_alive = self.settings.keep_alive_interval;
        let mut suppressed = 0u64;

        let end = {
            let mut feeder = pin!(feed(
                source,
                &mut writer,
                &state,
                &stop,
                keep_alive,
                &mut suppressed
            ));
            let mut consumer = pin!(self.consume(&mut reader, &stop, &feed_failed, report));

            tokio::select! {
                end = &mut consumer => end,
                fed = &mut feeder => match fed {
                    Ok(FeedEnd::Stopped) => consumer.await,
                    Ok(FeedEnd::SourceClosed) => {
                        stop.cancel();
                        consumer.await;
                        SessionEnd::Stopped
                    }
                    Err(e) => {
                        // A turn in progress still reaches its outcome
                        tracing::warn!(error = %e, phase = %state.phase(), "audio feed failed");
                        feed_failed.cancel();
                        match consumer.await {
                            SessionEnd::Stopped if stop.is_cancelled() => SessionEnd::Stopped,
                            _ => SessionEnd::Failed(e),
                        }
                    }
                },
            }
        };

        report.suppressed_chunks += suppressed;
        tracing::debug!(
            sent_chunks = writer.sent_chunks(),
            suppressed_chunks = suppressed,
            "session scope closed"
        );
        end
    }

    /// Read fragments, detect turns and run them
    ///
    /// Once `feed_failed` fires the consumer returns at the next point
    /// between turns.
    async fn consume(
        &mut self,
        reader: &mut SessionReader,
        stop: &CancellationToken,
        feed_failed: &CancellationToken,
        report: &mut RunReport,
    ) -> SessionEnd {
        let mut heard_at: Option<Instant> = None;

        loop {
            let silence_deadline = self
                .settings
                .silence_timeout
                .zip(heard_at)
                .map(|(timeout, at)| at + timeout);

            let observation = tokio::select! {
                biased;
                () = stop.cancelled() => return self.drain(reader).await,
                () = feed_failed.cancelled() => return SessionEnd::Closed,
                item = reader.next() => match item {
                    Some(Ok(fragment)) => {
                        let observation = self.state.observe(&fragment);
                        if observation != Observation::Dropped {
                            if fragment.is_final {
                                tracing::info!(text = %fragment.text, "hearing");
                            } else {
                                tracing::debug!(text = %fragment.text, "hearing");
                            }
                            heard_at = Some(Instant::now());
                        }
                        observation
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Closed,
                },
                () = tokio::time::sleep_until(silence_deadline.unwrap_or_else(Instant::now)),
                    if silence_deadline.is_some() =>
                {
                    heard_at = None;
                    match self.state.silence_elapsed() {
                        Some(observation) => observation,
                        None => continue,
                    }
                }
            };

            let Observation::Boundary { turn, text } = observation else {
                continue;
            };
            heard_at = None;

            if let Some(end) = self.turn(reader, stop, turn, text, report).await {
                return end;
            }

            if self
                .settings
                .max_turns
                .is_some_and(|max| report.turns_completed() >= max)
            {
                tracing::info!(turns = report.turns_completed(), "turn limit reached");
                stop.cancel();
            }
        }
    }

    /// Run a turn while discarding fragments that arrive meanwhile
    ///
    /// Returns how the session ended if it ended during the turn.
    async fn turn(
        &mut self,
        reader: &mut SessionReader,
        stop: &CancellationToken,
        turn: u64,
        heard: String,
        report: &mut RunReport,
    ) -> Option<SessionEnd> {
        tracing::info!(turn, heard = %heard, "processing");
        let state = self.state.clone();
        let mut session_end = None;

        let outcome = {
            let mut running = pin!(self.pipeline.run(&state, turn, heard));
            loop {
                tokio::select! {
                    outcome = &mut running => break outcome,
                    () = stop.cancelled() => {
                        break TurnOutcome::Abandoned {
                            reason: "cancelled".to_string(),
                        };
                    }
                    item = reader.next(), if session_end.is_none() => match item {
                        Some(Ok(fragment)) => {
                            state.observe(&fragment);
                        }
                        Some(Err(e)) => session_end = Some(SessionEnd::Failed(e)),
                        None => session_end = Some(SessionEnd::Closed),
                    },
                }
            }
        };

        if let Err(e) = self.state.finish_turn(outcome.clone()) {
            return Some(SessionEnd::Failed(e));
        }
        tracing::info!(turn, outcome = ?outcome, "listening");
        report.record(&outcome);
        session_end
    }

    /// Read what is left after end-of-stream, for at most the drain timeout
    async fn drain(&self, reader: &mut SessionReader) -> SessionEnd {
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(item) = reader.next().await {
                match item {
                    Ok(fragment) => {
                        tracing::debug!(text = %fragment.text, "fragment after end of stream");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "session ended while draining");
                        break;
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout_ms = self.settings.drain_timeout.as_millis(),
                "transcription session did not drain in time"
            );
        }
        SessionEnd::Stopped
    }
}

/// Move captured audio into the session while the conversation listens
async fn feed<S>(
    source: &mut S,
    writer: &mut SessionWriter,
    state: &ConversationState,
    stop: &CancellationToken,
    keep_alive: Duration,
    suppressed: &mut u64,
) -> Result<FeedEnd>
where
    S: AudioSource + ?Sized,
{
    let mut last_sent = Instant::now();

    loop {
        let chunk = tokio::select! {
            biased;
            () = stop.cancelled() => {
                finish(writer).await;
                return Ok(FeedEnd::Stopped);
            }
            chunk = source.next_chunk() => chunk?,
        };

        let Some(chunk) = chunk else {
            tracing::info!("audio source closed");
            finish(writer).await;
            return Ok(FeedEnd::SourceClosed);
        };

        if let CaptureStatus::Overrun { dropped } = chunk.status {
            tracing::warn!(dropped, "capture overrun, audio lost");
        }

        if state.capture_enabled() {
            writer.send(chunk).await?;
            last_sent = Instant::now();
        } else {
            *suppressed += 1;
            if last_sent.elapsed() >= keep_alive {
                writer.keep_alive().await?;
                last_sent = Instant::now();
            }
        }
    }
}

/// Send end-of-stream on the way out; the session is not reused either way
async fn finish(writer: &mut SessionWriter) {
    if let Err(e) = writer.finish().await {
        tracing::warn!(error = %e, "end of stream not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_each_outcome_once() {
        let mut report = RunReport::default();
        report.record(&TurnOutcome::Spoken);
        report.record(&TurnOutcome::Abandoned {
            reason: "loading".to_string(),
        });
        report.record(&TurnOutcome::SpeechFailed {
            reason: "no audio".to_string(),
        });

        assert_eq!(report.turns_spoken, 1);
        assert_eq!(report.turns_abandoned, 1);
        assert_eq!(report.turns_speech_failed, 1);
        assert_eq!(report.turns_completed(), 3);
    }

    #[test]
    fn default_settings_follow_config_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.session.sample_rate, 16_000);
        assert_eq!(settings.restart_policy.max_retries, 5);
        assert!(settings.max_turns.is_none());
    }
}

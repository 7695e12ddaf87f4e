//! Scripted collaborators for driving the orchestrator without network or
//! audio hardware

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use voice_loop::conversation::{AgentRoster, AgentSelection, TurnDetector};
use voice_loop::reply::parse_response;
use voice_loop::retry::{FallbackPolicy, RetryPolicy};
use voice_loop::stt::{AudioSink, FragmentStream, SessionParams};
use voice_loop::voice::CaptureStatus;
use voice_loop::{
    AudioChunk, AudioSource, ConversationState, Error, OrchestratorSettings, Phase, Player,
    ReplyBackend, Result, RunReport, Snapshot, SpeechBackend, SpeechSynthesizer, StatusEvent,
    Transcriber, TranscriptFragment, TranscriptionSession, TurnOrchestrator, TurnPipeline,
    ReplyGenerator,
};

pub const PRIMARY: &str = "gpt2";
pub const FALLBACK: &str = "distilgpt2";

/// One thing a scripted session does on its fragment stream
#[derive(Debug, Clone)]
pub enum Step {
    /// Yield a fragment
    Say(TranscriptFragment),
    /// Wait before the next step
    Pause(Duration),
    /// Wait until the conversation reaches a phase
    AwaitPhase(Phase),
    /// Record a snapshot of the conversation
    Snapshot,
    /// Fail the session
    Break(String),
    /// Close the stream as the service would
    Close,
}

/// A final fragment
pub fn heard(text: &str) -> Step {
    Step::Say(TranscriptFragment {
        text: text.to_string(),
        is_final: true,
    })
}

/// An interim fragment
pub fn partial(text: &str) -> Step {
    Step::Say(TranscriptFragment {
        text: text.to_string(),
        is_final: false,
    })
}

/// What happens when a session is opened
#[derive(Debug, Clone)]
pub enum Script {
    /// The open fails
    Refuse(String),
    /// The open succeeds and the stream plays these steps, then stays open
    /// until end of stream is sent
    Session(Vec<Step>),
    /// Like `Session`, but the outbound half fails at `fault`
    Faulty { steps: Vec<Step>, fault: SinkFault },
}

/// Where a scripted session's outbound half fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFault {
    /// Keep-alives fail; they are only sent while a turn is in progress
    KeepAlive,
    /// End of stream is lost on the way out
    EndStream,
}

/// What the scripted sessions saw
#[derive(Debug, Default)]
pub struct SessionLog {
    /// Phase at the moment each audio chunk was sent
    pub sent_phases: Mutex<Vec<Phase>>,
    pub keep_alives: AtomicU64,
    pub finished: AtomicU64,
    pub snapshots: Mutex<Vec<Snapshot>>,
}

impl SessionLog {
    pub fn sent_phases(&self) -> Vec<Phase> {
        self.sent_phases.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

/// Transcriber whose sessions follow scripts, one per open
pub struct ScriptedTranscriber {
    state: ConversationState,
    scripts: Mutex<VecDeque<Script>>,
    exhausted: Script,
    opens: AtomicU32,
    pub log: Arc<SessionLog>,
}

impl ScriptedTranscriber {
    pub fn new(state: ConversationState, scripts: Vec<Script>, exhausted: Script) -> Self {
        Self {
            state,
            scripts: Mutex::new(scripts.into()),
            exhausted,
            opens: AtomicU32::new(0),
            log: Arc::default(),
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn open(&self, _params: &SessionParams) -> Result<TranscriptionSession> {
        let id = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.exhausted.clone());

        let (steps, fault) = match script {
            Script::Refuse(reason) => return Err(Error::SessionBroken(reason)),
            Script::Session(steps) => (steps, None),
            Script::Faulty { steps, fault } => (steps, Some(fault)),
        };

        let ended = Arc::new(Notify::new());
        let sink = ScriptedSink {
            state: self.state.clone(),
            log: Arc::clone(&self.log),
            ended: Arc::clone(&ended),
            fault,
        };
        let cursor = Cursor {
            steps: steps.into(),
            state: self.state.clone(),
            log: Arc::clone(&self.log),
            ended,
        };
        Ok(TranscriptionSession::new(
            u64::from(id),
            Box::new(sink),
            fragment_stream(cursor),
        ))
    }
}

struct ScriptedSink {
    state: ConversationState,
    log: Arc<SessionLog>,
    ended: Arc<Notify>,
    fault: Option<SinkFault>,
}

#[async_trait]
impl AudioSink for ScriptedSink {
    async fn send_audio(&mut self, _audio: Vec<u8>) -> Result<()> {
        self.log.sent_phases.lock().unwrap().push(self.state.phase());
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<()> {
        if self.fault == Some(SinkFault::KeepAlive) {
            return Err(Error::SessionBroken("keep-alive rejected".to_string()));
        }
        self.log.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_stream(&mut self) -> Result<()> {
        self.ended.notify_one();
        if self.fault == Some(SinkFault::EndStream) {
            return Err(Error::SessionBroken("connection reset".to_string()));
        }
        self.log.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Cursor {
    steps: VecDeque<Step>,
    state: ConversationState,
    log: Arc<SessionLog>,
    ended: Arc<Notify>,
}

fn fragment_stream(cursor: Cursor) -> FragmentStream {
    futures::stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;
        loop {
            match cursor.steps.pop_front() {
                Some(Step::Say(fragment)) => return Some((Ok(fragment), Some(cursor))),
                Some(Step::Pause(delay)) => tokio::time::sleep(delay).await,
                Some(Step::AwaitPhase(phase)) => {
                    while cursor.state.phase() != phase {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                Some(Step::Snapshot) => {
                    let snapshot = cursor.state.snapshot();
                    cursor.log.snapshots.lock().unwrap().push(snapshot);
                }
                Some(Step::Break(reason)) => {
                    return Some((Err(Error::SessionBroken(reason)), None));
                }
                Some(Step::Close) => return None,
                None => {
                    cursor.ended.notified().await;
                    return None;
                }
            }
        }
    })
    .boxed()
}

/// Source yielding silent reference-size chunks on an interval
pub struct TickingSource {
    interval: Duration,
    remaining: Option<u64>,
    device_lost: bool,
}

impl TickingSource {
    pub fn endless(interval: Duration) -> Self {
        Self {
            interval,
            remaining: None,
            device_lost: false,
        }
    }

    pub fn finite(interval: Duration, chunks: u64) -> Self {
        Self {
            interval,
            remaining: Some(chunks),
            device_lost: false,
        }
    }

    /// The device disappears after `chunks`
    pub fn unplugged(interval: Duration, chunks: u64) -> Self {
        Self {
            device_lost: true,
            ..Self::finite(interval, chunks)
        }
    }
}

#[async_trait]
impl AudioSource for TickingSource {
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        if self.remaining == Some(0) {
            if self.device_lost {
                return Err(Error::Audio("input device disconnected".to_string()));
            }
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok(Some(AudioChunk {
            bytes: vec![0; 2048],
            status: CaptureStatus::Ok,
        }))
    }

    fn dropped_chunks(&self) -> u64 {
        0
    }
}

type Respond = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Reply backend answering per model and recording every call
pub struct ScriptedReplies {
    respond: Respond,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedReplies {
    pub fn new(respond: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::default(),
        })
    }

    /// Every model answers `text`
    pub fn answering(text: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(text.to_string()))
    }

    /// Each model returns a raw inference response body
    pub fn bodies(body: impl Fn(&str) -> &'static str + Send + Sync + 'static) -> Arc<Self> {
        Self::new(move |model| parse_response(model, 200, body(model)))
    }

    /// (model, input) for each call, in order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyBackend for ScriptedReplies {
    async fn generate(&self, text: &str, model: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), text.to_string()));
        (self.respond)(model)
    }
}

/// Speech backend recording (text, voice) pairs
#[derive(Default)]
pub struct RecordingSpeech {
    failing: bool,
    said: Mutex<Vec<(String, String)>>,
}

impl RecordingSpeech {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn said(&self) -> Vec<(String, String)> {
        self.said.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechBackend for RecordingSpeech {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        self.said
            .lock()
            .unwrap()
            .push((text.to_string(), voice.to_string()));
        if self.failing {
            return Err(Error::Synthesis("voice unavailable".to_string()));
        }
        Ok(format!("audio:{text}").into_bytes())
    }
}

/// Player recording what it played; playback takes `delay`
#[derive(Clone, Default)]
pub struct RecordingPlayer {
    pub delay: Duration,
    played: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingPlayer {
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn play(&mut self, audio: &[u8]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.played.lock().unwrap().push(audio.to_vec());
        Ok(())
    }
}

/// Settings scaled down for tests: one turn, millisecond backoff
pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        session: SessionParams {
            language_code: "en-US".to_string(),
            sample_rate: 16_000,
            channels: 1,
            encoding: "linear16".to_string(),
        },
        silence_timeout: None,
        drain_timeout: Duration::from_millis(200),
        keep_alive_interval: Duration::from_millis(5),
        restart_policy: RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
        max_turns: Some(1),
    }
}

/// Everything a test needs to build and inspect an orchestrator
pub struct Rig {
    pub state: ConversationState,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub replies: Arc<ScriptedReplies>,
    pub speech: Arc<RecordingSpeech>,
    pub player: RecordingPlayer,
    pub settings: OrchestratorSettings,
}

impl Rig {
    /// Sessions follow `scripts`; later opens succeed and stay silent
    pub fn new(scripts: Vec<Script>, replies: Arc<ScriptedReplies>) -> Self {
        Self::build(scripts, Script::Session(Vec::new()), replies)
    }

    /// Every open fails
    pub fn refusing(replies: Arc<ScriptedReplies>) -> Self {
        Self::build(
            Vec::new(),
            Script::Refuse("connection refused".to_string()),
            replies,
        )
    }

    pub fn build(scripts: Vec<Script>, exhausted: Script, replies: Arc<ScriptedReplies>) -> Self {
        let state = ConversationState::new(TurnDetector::default(), true);
        let transcriber = Arc::new(ScriptedTranscriber::new(state.clone(), scripts, exhausted));
        Self {
            state,
            transcriber,
            replies,
            speech: Arc::default(),
            player: RecordingPlayer::default(),
            settings: settings(),
        }
    }

    pub fn orchestrator(&self) -> TurnOrchestrator {
        let generator = ReplyGenerator::new(
            Arc::clone(&self.replies) as Arc<dyn ReplyBackend>,
            FallbackPolicy {
                primary: PRIMARY.to_string(),
                fallback: Some(FALLBACK.to_string()),
                backoff: Duration::from_millis(1),
            },
            Duration::from_secs(1),
        );
        let synthesizer = SpeechSynthesizer::new(
            Arc::clone(&self.speech) as Arc<dyn SpeechBackend>,
            Duration::from_secs(1),
        );
        let roster = AgentRoster::new(
            vec!["rachel".to_string(), "domi".to_string()],
            AgentSelection::RoundRobin,
        )
        .unwrap();

        TurnOrchestrator::new(
            Arc::clone(&self.transcriber) as Arc<dyn Transcriber>,
            TurnPipeline {
                generator,
                synthesizer,
                roster,
                player: Box::new(self.player.clone()),
            },
            self.state.clone(),
            self.settings.clone(),
        )
    }
}

/// Run to completion, failing the test if the run hangs
pub async fn run_to_end(
    orchestrator: &mut TurnOrchestrator,
    source: &mut TickingSource,
    cancel: CancellationToken,
) -> Result<RunReport> {
    tokio::time::timeout(Duration::from_secs(5), orchestrator.run(source, cancel))
        .await
        .expect("run did not finish")
}

/// Every event published so far
pub fn events(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Phases entered, in order, starting from the first transition
pub fn trajectory(events: &[StatusEvent]) -> Vec<Phase> {
    let mut phases = Vec::new();
    for event in events {
        if let StatusEvent::PhaseChanged { from, to } = event {
            if phases.is_empty() {
                phases.push(*from);
            }
            phases.push(*to);
        }
    }
    phases
}

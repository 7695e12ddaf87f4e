//! Streaming speech-to-text sessions
//!
//! A session is a bidirectional stream: audio goes in through a
//! [`SessionWriter`], transcript fragments come out of a [`SessionReader`].
//! The two halves are driven by separate futures, so they share the
//! session's lifecycle through [`SessionStatus`].

mod deepgram;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::voice::AudioChunk;
use crate::{Error, Result};

pub use deepgram::DeepgramTranscriber;

/// One piece of recognized speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    /// Best transcription of the segment
    pub text: String,
    /// The service will not revise this segment again
    pub is_final: bool,
}

/// Parameters for opening a session
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// BCP-47 language code, e.g. "en-US"
    pub language_code: String,
    /// Sample rate of the audio that will be sent
    pub sample_rate: u32,
    /// Channel count of the audio that will be sent
    pub channels: u16,
    /// Encoding name understood by the service, e.g. "linear16"
    pub encoding: String,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Accepting audio
    Open = 0,
    /// End of stream sent; pending results still arriving
    Draining = 1,
    /// No more results
    Closed = 2,
}

/// Lifecycle shared by both halves of a session; only ever moves forward
#[derive(Debug, Clone)]
pub struct SessionStatus(Arc<AtomicU8>);

impl Default for SessionStatus {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Open as u8)))
    }
}

impl SessionStatus {
    /// Current state
    #[must_use]
    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Open,
            1 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }

    /// Advance to `state`; moving backwards is ignored
    pub fn advance(&self, state: SessionState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// Outbound half of a session as implemented by a provider
#[async_trait]
pub trait AudioSink: Send {
    /// Send raw audio
    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()>;

    /// Keep an idle session from timing out
    async fn keep_alive(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tell the service no more audio follows
    async fn end_stream(&mut self) -> Result<()>;
}

/// Inbound half of a session as implemented by a provider
pub type FragmentStream = BoxStream<'static, Result<TranscriptFragment>>;

/// Opens streaming transcription sessions
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Open a fresh session
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be reached or rejects the parameters
    async fn open(&self, params: &SessionParams) -> Result<TranscriptionSession>;
}

/// An open transcription session
pub struct TranscriptionSession {
    id: u64,
    sink: Box<dyn AudioSink>,
    fragments: FragmentStream,
    status: SessionStatus,
}

impl std::fmt::Debug for TranscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionSession")
            .field("id", &self.id)
            .field("state", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl TranscriptionSession {
    /// Assemble a session from provider halves
    #[must_use]
    pub fn new(id: u64, sink: Box<dyn AudioSink>, fragments: FragmentStream) -> Self {
        Self {
            id,
            sink,
            fragments,
            status: SessionStatus::default(),
        }
    }

    /// Session identifier, unique per transcriber
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Shared lifecycle
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Separate the writing and reading halves
    #[must_use]
    pub fn split(self) -> (SessionWriter, SessionReader) {
        (
            SessionWriter {
                sink: self.sink,
                status: self.status.clone(),
                sent_chunks: 0,
            },
            SessionReader {
                fragments: self.fragments,
                status: self.status,
            },
        )
    }
}

/// Writing half of a session
pub struct SessionWriter {
    sink: Box<dyn AudioSink>,
    status: SessionStatus,
    sent_chunks: u64,
}

impl SessionWriter {
    /// Forward a chunk of captured audio
    ///
    /// # Errors
    ///
    /// Returns `SessionBroken` once end of stream was sent or the session
    /// closed, or if the provider fails to send
    pub async fn send(&mut self, chunk: AudioChunk) -> Result<()> {
        if self.status.get() != SessionState::Open {
            return Err(Error::SessionBroken(format!(
                "cannot send audio while {:?}",
                self.status.get()
            )));
        }
        self.sink.send_audio(chunk.bytes).await?;
        self.sent_chunks += 1;
        Ok(())
    }

    /// Keep the session alive while no audio is forwarded
    ///
    /// # Errors
    ///
    /// Returns error if the provider fails to send
    pub async fn keep_alive(&mut self) -> Result<()> {
        if self.status.get() != SessionState::Open {
            return Ok(());
        }
        self.sink.keep_alive().await
    }

    /// Signal end of stream; the session drains and then closes
    ///
    /// # Errors
    ///
    /// Returns error if the provider fails to send
    pub async fn finish(&mut self) -> Result<()> {
        if self.status.get() != SessionState::Open {
            return Ok(());
        }
        self.status.advance(SessionState::Draining);
        tracing::debug!(sent_chunks = self.sent_chunks, "end of audio stream");
        self.sink.end_stream().await
    }

    /// Chunks forwarded so far
    #[must_use]
    pub const fn sent_chunks(&self) -> u64 {
        self.sent_chunks
    }
}

/// Reading half of a session
///
/// Yields fragments until the service closes the stream. An error item
/// means the session is broken; the stream is closed after it.
pub struct SessionReader {
    fragments: FragmentStream,
    status: SessionStatus,
}

impl Stream for SessionReader {
    type Item = Result<TranscriptFragment>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.status.get() == SessionState::Closed {
            return Poll::Ready(None);
        }

        match this.fragments.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.status.advance(SessionState::Closed);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.status.advance(SessionState::Closed);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::voice::CaptureStatus;

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().push(format!("audio:{}", audio.len()));
            Ok(())
        }

        async fn end_stream(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("end".to_string());
            Ok(())
        }
    }

    fn chunk() -> AudioChunk {
        AudioChunk {
            bytes: vec![0; 2048],
            status: CaptureStatus::Ok,
        }
    }

    fn session(
        items: Vec<Result<TranscriptFragment>>,
    ) -> (TranscriptionSession, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink(Arc::clone(&log)));
        let session = TranscriptionSession::new(1, sink, futures::stream::iter(items).boxed());
        (session, log)
    }

    #[tokio::test]
    async fn open_draining_closed() {
        let (session, log) = session(vec![Ok(TranscriptFragment {
            text: "hi".to_string(),
            is_final: true,
        })]);
        let status = session.status();
        let (mut writer, mut reader) = session.split();

        assert_eq!(status.get(), SessionState::Open);
        writer.send(chunk()).await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(status.get(), SessionState::Draining);

        // Audio after end of stream is refused
        assert!(matches!(
            writer.send(chunk()).await,
            Err(Error::SessionBroken(_))
        ));

        assert!(reader.next().await.unwrap().is_ok());
        assert!(reader.next().await.is_none());
        assert_eq!(status.get(), SessionState::Closed);
        assert_eq!(*log.lock().unwrap(), vec!["audio:2048", "end"]);
    }

    #[tokio::test]
    async fn error_closes_reader() {
        let (session, _) = session(vec![
            Err(Error::SessionBroken("bad request".to_string())),
            Ok(TranscriptFragment {
                text: "never seen".to_string(),
                is_final: true,
            }),
        ]);
        let (_writer, mut reader) = session.split();

        assert!(reader.next().await.unwrap().is_err());
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn status_never_moves_backwards() {
        let status = SessionStatus::default();
        status.advance(SessionState::Closed);
        status.advance(SessionState::Draining);
        assert_eq!(status.get(), SessionState::Closed);
    }
}

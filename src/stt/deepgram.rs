//! Deepgram live transcription over a websocket

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{AudioSink, SessionParams, Transcriber, TranscriptFragment, TranscriptionSession};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sent to end the audio stream; the service flushes and closes
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

/// Sent while no audio flows so the service does not time the session out
const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;

/// Message from the live transcription API
#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: DeepgramChannel,
        #[serde(default)]
        is_final: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// What one websocket message means for the session
#[derive(Debug)]
enum Frame {
    Fragment(TranscriptFragment),
    Skip,
    Closed,
    Broken(Error),
}

/// Opens Deepgram live transcription sessions
pub struct DeepgramTranscriber {
    api_key: SecretString,
    endpoint: Url,
    model: String,
    open_timeout: Duration,
    next_id: AtomicU64,
}

impl DeepgramTranscriber {
    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the endpoint is not a URL
    pub fn new(
        api_key: SecretString,
        endpoint: &str,
        model: String,
        open_timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid transcription endpoint: {e}")))?;

        Ok(Self {
            api_key,
            endpoint,
            model,
            open_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Streaming URL for a session
    fn listen_url(&self, params: &SessionParams) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", &params.language_code)
            .append_pair("encoding", &params.encoding)
            .append_pair("sample_rate", &params.sample_rate.to_string())
            .append_pair("channels", &params.channels.to_string())
            .append_pair("punctuate", "true")
            .append_pair("interim_results", "true");
        url
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn open(&self, params: &SessionParams) -> Result<TranscriptionSession> {
        let url = self.listen_url(params);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Stt(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid Deepgram API key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        #[allow(clippy::cast_possible_truncation)]
        let millis = self.open_timeout.as_millis() as u64;
        let (socket, response) = tokio::time::timeout(self.open_timeout, connect_async(request))
            .await
            .map_err(|_| Error::Timeout {
                operation: "transcription connect",
                millis,
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram connect failed");
                Error::Stt(e.to_string())
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            session = id,
            status = %response.status(),
            language = %params.language_code,
            "transcription session opened"
        );

        let (write, read) = socket.split();
        Ok(TranscriptionSession::new(
            id,
            Box::new(DeepgramSink { write }),
            fragments(read),
        ))
    }
}

/// Outbound half of a Deepgram session
struct DeepgramSink {
    write: SplitSink<Socket, Message>,
}

#[async_trait]
impl AudioSink for DeepgramSink {
    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<()> {
        self.write
            .send(Message::binary(audio))
            .await
            .map_err(|e| Error::SessionBroken(e.to_string()))
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.write
            .send(Message::text(KEEP_ALIVE))
            .await
            .map_err(|e| Error::SessionBroken(e.to_string()))
    }

    async fn end_stream(&mut self) -> Result<()> {
        self.write
            .send(Message::text(CLOSE_STREAM))
            .await
            .map_err(|e| Error::SessionBroken(e.to_string()))
    }
}

/// Fragments read from the socket; ends on close, stops after the first error
fn fragments(read: SplitStream<Socket>) -> super::FragmentStream {
    futures::stream::unfold(Some(read), |read| async move {
        let mut read = read?;
        loop {
            let message = read.next().await?;
            match interpret(message) {
                Frame::Fragment(fragment) => return Some((Ok(fragment), Some(read))),
                Frame::Skip => {}
                Frame::Closed => return None,
                Frame::Broken(e) => return Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

fn interpret(message: std::result::Result<Message, tungstenite::Error>) -> Frame {
    match message {
        Ok(Message::Text(text)) => parse_results(text.as_str()),
        Ok(Message::Close(None)) => Frame::Closed,
        Ok(Message::Close(Some(frame))) => {
            if frame.code == CloseCode::Normal {
                Frame::Closed
            } else {
                tracing::warn!(
                    code = %frame.code,
                    reason = %frame.reason.as_str(),
                    "transcription session closed abnormally"
                );
                Frame::Broken(Error::SessionBroken(format!(
                    "closed with {}: {}",
                    frame.code,
                    frame.reason.as_str()
                )))
            }
        }
        Ok(_) => Frame::Skip,
        Err(e) => Frame::Broken(Error::SessionBroken(e.to_string())),
    }
}

fn parse_results(text: &str) -> Frame {
    match serde_json::from_str::<DeepgramMessage>(text) {
        Ok(DeepgramMessage::Results { channel, is_final }) => channel
            .alternatives
            .into_iter()
            .next()
            .map_or(Frame::Skip, |alt| {
                Frame::Fragment(TranscriptFragment {
                    text: alt.transcript,
                    is_final,
                })
            }),
        Ok(DeepgramMessage::Other) => Frame::Skip,
        Err(e) => {
            tracing::warn!(error = %e, "unrecognized transcription message");
            Frame::Skip
        }
    }
}

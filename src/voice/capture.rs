//! Audio capture from microphone
//!
//! The cpal callback runs on a real-time thread and must never block. It
//! packs samples into fixed-size PCM chunks and offers them to a bounded
//! queue; when the consumer falls behind, new chunks are dropped and the
//! next delivered chunk reports how many were lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Frames per chunk; 2048 bytes of mono 16-bit audio
pub const CHUNK_FRAMES: usize = 1024;

/// PCM layout of captured audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,
    /// Interleaved channels
    pub channels: u16,
    /// Bits per sample; only 16 is produced
    pub bit_depth: u16,
    /// Frames per chunk
    pub chunk_frames: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            bit_depth: 16,
            chunk_frames: CHUNK_FRAMES,
        }
    }
}

impl AudioFormat {
    /// Bytes in one chunk
    #[must_use]
    pub const fn chunk_bytes(&self) -> usize {
        self.chunk_frames * self.channels as usize * (self.bit_depth as usize / 8)
    }
}

/// Condition of the capture stream when a chunk was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// No loss
    Ok,
    /// Chunks were dropped immediately before this one
    Overrun {
        /// How many
        dropped: u64,
    },
}

/// A fixed-size block of little-endian 16-bit PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw PCM bytes
    pub bytes: Vec<u8>,
    /// Capture condition
    pub status: CaptureStatus,
}

/// Anything that yields captured audio chunks
#[async_trait]
pub trait AudioSource: Send {
    /// Wait for the next chunk; `None` once the source is closed
    ///
    /// # Errors
    ///
    /// Returns error if the device failed
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>>;

    /// Chunks dropped because the consumer fell behind
    fn dropped_chunks(&self) -> u64;
}

/// Producer side of the chunk queue, owned by the capture callback
pub struct ChunkQueue {
    tx: mpsc::Sender<AudioChunk>,
    chunk_bytes: usize,
    pending: Vec<u8>,
    dropped_since_sent: u64,
    dropped_total: Arc<AtomicU64>,
}

impl ChunkQueue {
    /// Create a queue holding at most `capacity` chunks
    #[must_use]
    pub fn new(
        format: AudioFormat,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<AudioChunk>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped_total = Arc::new(AtomicU64::new(0));
        let chunk_bytes = format.chunk_bytes();
        (
            Self {
                tx,
                chunk_bytes,
                pending: Vec::with_capacity(chunk_bytes),
                dropped_since_sent: 0,
                dropped_total: Arc::clone(&dropped_total),
            },
            rx,
            dropped_total,
        )
    }

    /// Append samples; completed chunks are offered without blocking
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.pending.extend_from_slice(&to_i16(sample).to_le_bytes());
            if self.pending.len() >= self.chunk_bytes {
                let bytes =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_bytes));
                self.offer(bytes);
            }
        }
    }

    fn offer(&mut self, bytes: Vec<u8>) {
        let status = if self.dropped_since_sent == 0 {
            CaptureStatus::Ok
        } else {
            CaptureStatus::Overrun {
                dropped: self.dropped_since_sent,
            }
        };

        match self.tx.try_send(AudioChunk { bytes, status }) {
            Ok(()) => self.dropped_since_sent = 0,
            Err(TrySendError::Full(_)) => {
                self.dropped_since_sent += 1;
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
            // Consumer gone; the stream is about to be torn down
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Captures audio from the default input device
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread for
/// the lifetime of this handle. Stopping or dropping the handle releases
/// the device and joins that thread.
pub struct MicrophoneSource {
    rx: mpsc::Receiver<AudioChunk>,
    dropped: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<String>>>,
    failed: Arc<Notify>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn start(format: AudioFormat, queue_capacity: usize) -> Result<Self> {
        if format.bit_depth != 16 {
            return Err(Error::Config(format!(
                "unsupported bit depth {}; only 16-bit capture is produced",
                format.bit_depth
            )));
        }

        let (queue, rx, dropped) = ChunkQueue::new(format, queue_capacity);
        let failure = Arc::new(Mutex::new(None));
        let failed = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        let thread = {
            let failure = Arc::clone(&failure);
            let failed = Arc::clone(&failed);
            std::thread::Builder::new()
                .name("audio-capture".to_string())
                .spawn(move || {
                    let stream = match open_stream(format, queue, failure, failed) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until stopped or the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("audio capture stopped");
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Audio("capture thread exited during startup".to_string()));
            }
        }

        tracing::debug!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            chunk_bytes = format.chunk_bytes(),
            queue_capacity,
            "audio capture started"
        );

        Ok(Self {
            rx,
            dropped,
            failure,
            failed,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop capturing and release the device
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the capture thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn take_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        if let Some(reason) = self.take_failure() {
            return Err(Error::Audio(reason));
        }

        tokio::select! {
            chunk = self.rx.recv() => Ok(chunk),
            () = self.failed.notified() => {
                let reason = self
                    .take_failure()
                    .unwrap_or_else(|| "capture stream failed".to_string());
                Err(Error::Audio(reason))
            }
        }
    }

    fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build and start the cpal input stream on the current thread
fn open_stream(
    format: AudioFormat,
    mut queue: ChunkQueue,
    failure: Arc<Mutex<Option<String>>>,
    failed: Arc<Notify>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == format.channels
                && c.min_sample_rate() <= SampleRate(format.sample_rate)
                && c.max_sample_rate() >= SampleRate(format.sample_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(format.sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = format.sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                queue.push(data);
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
                failed.notify_one();
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Decode little-endian 16-bit PCM into samples
#[must_use]
pub fn pcm_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// RMS level of 16-bit PCM, normalized to [0.0, 1.0]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn pcm_level(pcm: &[u8]) -> f32 {
    let samples = pcm_samples(pcm);
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let s = f32::from(s) / 32768.0;
            s * s
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Wrap 16-bit PCM in a WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], format: AudioFormat) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for sample in pcm_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_format() -> AudioFormat {
        AudioFormat {
            chunk_frames: 4,
            ..AudioFormat::default()
        }
    }

    #[test]
    fn reference_chunk_is_2048_bytes() {
        assert_eq!(AudioFormat::default().chunk_bytes(), 2048);
    }

    #[test]
    fn samples_packed_into_fixed_chunks() {
        let (mut queue, mut rx, _) = ChunkQueue::new(small_format(), 8);
        queue.push(&[0.0, 0.5, -0.5, 1.0, 0.25, 0.25]);

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.bytes.len(), 8);
        assert_eq!(chunk.status, CaptureStatus::Ok);
        assert_eq!(pcm_samples(&chunk.bytes), vec![0, 16383, -16383, 32767]);

        // Two samples are still pending
        assert!(rx.try_recv().is_err());
        queue.push(&[0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap().bytes.len(), 8);
    }

    #[test]
    fn full_queue_drops_and_reports_overrun() {
        let (mut queue, mut rx, dropped) = ChunkQueue::new(small_format(), 1);

        // Three chunks into a queue of one: two dropped
        queue.push(&[0.1; 12]);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);

        assert_eq!(rx.try_recv().unwrap().status, CaptureStatus::Ok);
        queue.push(&[0.1; 4]);
        assert_eq!(
            rx.try_recv().unwrap().status,
            CaptureStatus::Overrun { dropped: 2 }
        );

        // Counter resets once a chunk gets through
        queue.push(&[0.1; 4]);
        assert_eq!(rx.try_recv().unwrap().status, CaptureStatus::Ok);
    }

    #[test]
    fn closed_consumer_is_ignored() {
        let (mut queue, rx, dropped) = ChunkQueue::new(small_format(), 1);
        drop(rx);
        queue.push(&[0.1; 8]);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn level_of_silence_is_zero() {
        assert!(pcm_level(&[0; 64]).abs() < f32::EPSILON);
        assert!(pcm_level(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn clamps_out_of_range() {
        assert_eq!(to_i16(2.0), 32767);
        assert_eq!(to_i16(-2.0), -32768);
    }
}

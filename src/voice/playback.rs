//! Audio playback to speakers

use std::io::Cursor;
use std::sync::mpsc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Time allowed past the expected duration before playback is declared stuck
const COMPLETION_GRACE: Duration = Duration::from_secs(2);

/// Pause after the last sample is handed to the device so it is heard
const DRAIN_TAIL: Duration = Duration::from_millis(100);

/// Input frames per resampler pass
const RESAMPLE_CHUNK: usize = 1024;

/// Plays encoded audio, returning only once output has finished
#[async_trait]
pub trait Player: Send {
    /// Play `audio` to completion
    ///
    /// # Errors
    ///
    /// Returns error if decoding or output fails
    async fn play(&mut self, audio: &[u8]) -> Result<()>;
}

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

/// Plays MP3 audio on the default output device
#[derive(Debug, Default)]
pub struct SpeakerPlayer;

impl SpeakerPlayer {
    /// Create a player, checking that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );

        Ok(Self)
    }

    /// Play raw mono samples to completion
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub async fn play_samples(&mut self, audio: DecodedAudio) -> Result<()> {
        tokio::task::spawn_blocking(move || play_blocking(audio))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

#[async_trait]
impl Player for SpeakerPlayer {
    async fn play(&mut self, audio: &[u8]) -> Result<()> {
        let decoded = decode_mp3(audio)?;
        self.play_samples(decoded).await
    }
}

/// Play samples on the current thread; the stream is dropped on every path
fn play_blocking(audio: DecodedAudio) -> Result<()> {
    if audio.samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device".to_string()))?;

    let config = output_config(&device, audio.sample_rate)?;
    let samples = resample(&audio.samples, audio.sample_rate, config.sample_rate.0)?;
    let channels = config.channels as usize;
    let sample_count = samples.len();

    // The output callback owns the samples; it reports completion once
    let (done_tx, done_rx) = mpsc::channel::<std::result::Result<(), String>>();
    let error_tx = done_tx.clone();
    let mut done_tx = Some(done_tx);
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    position = position.saturating_add(1);
                }
                if position >= sample_count {
                    if let Some(tx) = done_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                let _ = error_tx.send(Err(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let expected = Duration::from_millis(
        (sample_count as u64 * 1000) / u64::from(config.sample_rate.0.max(1)),
    );
    let outcome = match done_rx.recv_timeout(expected + COMPLETION_GRACE) {
        Ok(Ok(())) => {
            std::thread::sleep(DRAIN_TAIL);
            Ok(())
        }
        Ok(Err(reason)) => Err(Error::Playback(reason)),
        Err(_) => Err(Error::Playback(format!(
            "playback did not complete within {}ms",
            (expected + COMPLETION_GRACE).as_millis()
        ))),
    };

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");
    outcome
}

/// Pick an output config at `sample_rate`, or the device default
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let exact = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| c.channels() <= 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate);

    if let Some(supported) = exact {
        return Ok(supported.with_sample_rate(rate).config());
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::Playback(e.to_string()))?;
    tracing::debug!(
        from = sample_rate,
        to = fallback.sample_rate().0,
        "resampling for output device"
    );
    Ok(fallback.config())
}

/// Resample mono audio between rates
///
/// # Errors
///
/// Returns error if the resampler cannot be built
#[allow(clippy::cast_possible_truncation)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Playback(format!("resampler: {e}")))?;

    let expected_len = samples.len() * to as usize / from as usize;
    let mut out = Vec::with_capacity(expected_len + RESAMPLE_CHUNK);
    let mut position = 0;

    while position + resampler.input_frames_next() <= samples.len() {
        let next = resampler.input_frames_next();
        let input = [&samples[position..position + next]];
        let chunk = resampler
            .process(&input[..], None)
            .map_err(|e| Error::Playback(format!("resampler: {e}")))?;
        out.extend_from_slice(&chunk[0]);
        position += next;
    }

    if position < samples.len() {
        let input = [&samples[position..]];
        let chunk = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| Error::Playback(format!("resampler: {e}")))?;
        out.extend_from_slice(&chunk[0]);
    }

    Ok(out)
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                }

                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Playback("no MP3 frames in audio".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

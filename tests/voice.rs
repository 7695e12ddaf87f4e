//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;

use voice_loop::voice::{
    AudioFormat, CaptureStatus, ChunkQueue, SAMPLE_RATE, decode_mp3, pcm_level, pcm_samples,
    pcm_to_wav,
};

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Push samples through a capture queue and collect the chunks
fn capture(samples: &[f32], capacity: usize) -> Vec<voice_loop::AudioChunk> {
    let (mut queue, mut rx, _) = ChunkQueue::new(AudioFormat::default(), capacity);
    queue.push(samples);
    let mut chunks = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        chunks.push(chunk);
    }
    chunks
}

#[test]
fn test_one_second_is_fifteen_full_chunks() {
    // 16000 frames at 1024 per chunk; the remainder stays pending
    let chunks = capture(&generate_silence(1.0), 64);
    assert_eq!(chunks.len(), 15);
    assert!(chunks.iter().all(|c| c.bytes.len() == 2048));
    assert!(chunks.iter().all(|c| c.status == CaptureStatus::Ok));
}

#[test]
fn test_speech_louder_than_silence() {
    let speech = capture(&generate_sine_samples(440.0, 0.5, 0.5), 64);
    let silence = capture(&generate_silence(0.5), 64);

    let speech_level = pcm_level(&speech[0].bytes);
    let silence_level = pcm_level(&silence[0].bytes);

    // RMS of a sine is amplitude / sqrt(2)
    assert!((speech_level - 0.5 / 2f32.sqrt()).abs() < 0.02, "level {speech_level}");
    assert!(silence_level.abs() < f32::EPSILON);
}

#[test]
fn test_slow_consumer_loses_chunks() {
    let (mut queue, mut rx, dropped) = ChunkQueue::new(AudioFormat::default(), 4);
    queue.push(&generate_sine_samples(220.0, 1.0, 0.3));

    // Fifteen chunks offered to a queue of four
    assert_eq!(dropped.load(std::sync::atomic::Ordering::Relaxed), 11);

    let mut delivered = 0;
    while rx.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 4);
}

#[test]
fn test_captured_audio_saved_as_wav() {
    let format = AudioFormat::default();
    let chunks = capture(&generate_sine_samples(440.0, 0.25, 0.5), 64);
    let pcm: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.clone()).collect();

    let wav = pcm_to_wav(&pcm, format).unwrap();
    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(samples, pcm_samples(&pcm));
}

#[test]
fn test_empty_recording_is_valid_wav() {
    let wav = pcm_to_wav(&[], AudioFormat::default()).unwrap();
    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    assert_eq!(reader.len(), 0);
}

#[test]
fn test_synthesized_audio_must_be_mp3() {
    assert!(decode_mp3(b"audio:hi!").is_err());
}

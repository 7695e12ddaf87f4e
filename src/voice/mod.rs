//! Voice I/O
//!
//! Handles microphone capture and speaker playback. Transcription and
//! synthesis are network services (see `stt` and `tts`).

mod capture;
mod playback;

pub use capture::{
    AudioChunk, AudioFormat, AudioSource, CHUNK_FRAMES, CaptureStatus, ChunkQueue,
    MicrophoneSource, SAMPLE_RATE, pcm_level, pcm_samples, pcm_to_wav,
};
pub use playback::{DecodedAudio, Player, SpeakerPlayer, decode_mp3, resample};

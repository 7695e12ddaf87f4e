use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use voice_loop::reply::HuggingFaceBackend;
use voice_loop::tts::HttpSpeech;
use voice_loop::voice::{DecodedAudio, pcm_level, pcm_to_wav};
use voice_loop::{
    AudioSource, Config, Credentials, MicrophoneSource, Player, ReplyGenerator, SpeakerPlayer,
    SpeechSynthesizer, StopReason, TurnOrchestrator,
};

/// Voice Loop - talk with a text generation model
#[derive(Parser)]
#[command(name = "voice-loop", version, about)]
struct Cli {
    /// Config file to use instead of ~/.config/voice-loop/config.toml
    #[arg(short, long, env = "VOICE_LOOP_CONFIG")]
    config: Option<PathBuf>,

    /// JSON token file with service credentials
    #[arg(long, env = "VOICE_LOOP_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Stop after this many turns
    #[arg(long)]
    max_turns: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as a WAV file
        #[arg(short, long)]
        record: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Voice to use instead of the first configured one
        #[arg(long)]
        voice: Option<String>,
    },
    /// Test reply generation
    TestReply {
        /// Text to reply to
        #[arg(default_value = "Hello there.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,voice_loop=info",
        1 => "info,voice_loop=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load_from(cli.config.as_deref())?;
    if let Some(max_turns) = cli.max_turns {
        config.turn.max_turns = Some(max_turns);
    }
    let credentials_path = cli.credentials.or_else(|| config.credentials_path.clone());
    tracing::debug!(?config, "loaded configuration");

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, record } => test_mic(&config, duration, record).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text, voice } => {
                let credentials = Credentials::load(credentials_path.as_deref())?;
                test_tts(&config, &credentials, &text, voice).await
            }
            Command::TestReply { text } => {
                let credentials = Credentials::load(credentials_path.as_deref())?;
                test_reply(&config, &credentials, text).await
            }
        };
    }

    let credentials = Credentials::load(credentials_path.as_deref())?;
    let mut orchestrator = TurnOrchestrator::from_config(&config, &credentials)?;
    let mut microphone = MicrophoneSource::start(config.audio.format, config.audio.queue_capacity)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, finishing up");
            interrupt.cancel();
        }
    });

    tracing::info!(
        primary = %config.reply.primary_model,
        fallback = ?config.reply.fallback_model,
        voices = config.speech.voices.len(),
        "voice loop ready - start talking"
    );

    let report = orchestrator.run(&mut microphone, cancel).await;
    microphone.stop();
    let report = report?;

    println!(
        "{} turns spoken, {} without speech, {} abandoned, {} session restarts",
        report.turns_spoken,
        report.turns_speech_failed,
        report.turns_abandoned,
        report.session_restarts
    );
    if report.stop_reason == StopReason::MaxTurns {
        tracing::info!("turn limit reached");
    }

    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64, record: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let format = config.audio.format;
    let mut microphone = MicrophoneSource::start(format, config.audio.queue_capacity)?;
    println!("Sample rate: {} Hz", format.sample_rate);
    println!("---");

    let mut recording = Vec::new();
    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut second = Vec::new();

        while let Ok(chunk) = tokio::time::timeout_at(deadline, microphone.next_chunk()).await {
            match chunk? {
                Some(chunk) => second.extend_from_slice(&chunk.bytes),
                None => break,
            }
        }

        let level = pcm_level(&second);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {:.4} | [{}]", i + 1, level, meter);

        if record.is_some() {
            recording.extend_from_slice(&second);
        }
    }

    let dropped = microphone.dropped_chunks();
    microphone.stop();

    if let Some(path) = record {
        std::fs::write(&path, pcm_to_wav(&recording, format)?)?;
        println!("\nSaved {} bytes of audio to {}", recording.len(), path.display());
    }
    if dropped > 0 {
        println!("{dropped} chunks were dropped (consumer too slow)");
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut player = SpeakerPlayer::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    player
        .play_samples(DecodedAudio {
            samples,
            sample_rate,
        })
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test speech synthesis and playback
async fn test_tts(
    config: &Config,
    credentials: &Credentials,
    text: &str,
    voice: Option<String>,
) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = SpeechSynthesizer::new(
        Arc::new(HttpSpeech::from_config(&config.speech, credentials)?),
        config.speech.timeout,
    );
    let voice = voice
        .or_else(|| config.speech.voices.first().cloned())
        .ok_or_else(|| anyhow::anyhow!("no voice configured"))?;

    println!("Synthesizing speech with voice {voice}...");
    let audio = synthesizer.synthesize(text, &voice).await?;
    println!("Received {} bytes of audio", audio.len());

    println!("Playing...");
    SpeakerPlayer::new()?.play(&audio).await?;

    println!("\nTTS test complete!");
    Ok(())
}

/// Test reply generation against the configured models
async fn test_reply(
    config: &Config,
    credentials: &Credentials,
    text: String,
) -> anyhow::Result<()> {
    println!("Asking {} for a reply to: \"{text}\"\n", config.reply.primary_model);

    let generator = ReplyGenerator::new(
        Arc::new(HuggingFaceBackend::new(
            credentials.require_inference()?,
            &config.reply.endpoint,
        )?),
        config.fallback_policy(),
        config.reply.timeout,
    );

    let reply = generator.reply(generator.request(0, text)).await?;
    println!("{} ({} attempts): {}", reply.model, reply.attempts, reply.text);
    Ok(())
}

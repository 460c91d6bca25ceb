use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing_subscriber::EnvFilter;

use parley::pipeline::{HttpPipeline, Pipeline};
use parley::voice::{
    AudioCapture, AudioOutput, AudioStream, EnergyDetector, MicrophoneVad, RawVadEvent,
    SpeakerOutput, calculate_energy, wav,
};
use parley::{Config, Conversation};

/// Parley - hands-free voice conversation with a remote assistant
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Speech server base URL
    #[arg(short, long, env = "PARLEY_SERVER_URL")]
    server: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input and speech detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test speech synthesis through the server
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server.base_url = server.trim_end_matches('/').to_string();
    }
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker(&config).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
        };
    }

    tracing::info!(server = %config.server.base_url, "starting parley");

    let pipeline = Arc::new(HttpPipeline::new(&config.server)?);
    let output = SpeakerOutput::new(config.playback.rate)?;
    let mut conversation = Conversation::new(MicrophoneVad::new(), pipeline, output, &config);

    // Print status changes
    let mut statuses = WatchStream::new(conversation.subscribe());
    tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            println!("{status}");
        }
    });

    let handle = conversation.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            handle.stop();
        }
    });

    conversation.run().await?;
    Ok(())
}

#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
    let detector = Arc::new(Mutex::new(EnergyDetector::new(config.vad.clone())));

    let mut capture = AudioCapture::new()?;
    let callback_buffer = Arc::clone(&buffer);
    let callback_detector = Arc::clone(&detector);
    capture.open(move |samples| {
        if let Ok(mut buffer) = callback_buffer.lock() {
            buffer.extend_from_slice(samples);
        }
        if let Ok(mut detector) = callback_detector.lock() {
            for event in detector.push_samples(samples) {
                match event {
                    RawVadEvent::SpeechStart => println!("  >> speech start"),
                    RawVadEvent::SpeechEnd(audio) => {
                        println!("  >> speech end ({} samples)", audio.len());
                    }
                    RawVadEvent::Misfire => println!("  >> misfire"),
                }
            }
        }
    })?;
    capture.resume()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = buffer
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!(
        "Speech starts at RMS {:.4}; raise PARLEY_VAD_POSITIVE if noise triggers it.",
        config.vad.positive_speech_threshold * config.vad.energy_reference
    );

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    // Generate 2 seconds of 440Hz sine wave at 24kHz sample rate
    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    let bytes = wav::encode(&samples, sample_rate)?;
    let mut output = SpeakerOutput::new(config.playback.rate)?;
    output
        .play(AudioStream::from_bytes(Some("audio/wav".to_string()), bytes))
        .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test speech synthesis through the server
#[allow(clippy::future_not_send)]
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");
    println!("Server: {}", config.server.base_url);

    let pipeline = HttpPipeline::new(&config.server)?;

    println!("Synthesizing speech...");
    let audio = pipeline.synthesize(text).await?;
    println!("Content type: {}", audio.content_type().unwrap_or("unknown"));

    println!("Playing audio...");
    let mut output = SpeakerOutput::new(config.playback.rate)?;
    output.play(audio).await??;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vesper_voice::assistant::{Assistant, GeminiClient, Transcriber};
use vesper_voice::realtime::WebSocketConnector;
use vesper_voice::session::{CommandTables, LocalCommandInterceptor, Sender};
use vesper_voice::tools::{Toolbox, WebSearchTool};
use vesper_voice::voice::{
    AudioBackend, CpalBackend, InputDevice, LevelMeter, MODEL_OUTPUT_SAMPLE_RATE, PlaybackScheduler,
    RecognizerFactory, SpeechSegmentRecognizerFactory, SpeechToText, normalized_level, pcm_mime,
    pcm16_le, rms,
};
use vesper_voice::{Config, SessionHandle, SessionServices, SessionSnapshot, SessionState};

/// Vesper - Real-time voice assistant
#[derive(Parser)]
#[command(name = "vesper", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not listen for the wake word while in standby
    #[arg(long, env = "VESPER_NO_WAKE")]
    no_wake: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Start a voice session with a console (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Speak text through the configured voice
    Say {
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
        0 => "info,vesper_voice=info",
        1 => "info,vesper_voice=debug",
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

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_session(!cli.no_wake).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Say { text } => say(&text).await,
    }
}

/// Build the session collaborators from configuration
fn services(config: &Config, wake_enabled: bool) -> anyhow::Result<SessionServices> {
    let audio: Arc<dyn AudioBackend> = Arc::new(CpalBackend);
    let gemini = Arc::new(GeminiClient::new(
        config.api_key.clone(),
        config.gemini.clone(),
    ));
    let connector = WebSocketConnector::new(&config.realtime_url, config.api_key.clone())?;

    let mut toolbox = Toolbox::new(gemini.clone());
    if let Some(key) = &config.api_keys.brave {
        toolbox = toolbox.with_web_search(WebSearchTool::new_brave(key.clone()));
    } else if let Some(key) = &config.api_keys.serper {
        toolbox = toolbox.with_web_search(WebSearchTool::new_serper(key.clone()));
    }

    let recognizer: Option<Arc<dyn RecognizerFactory>> = if wake_enabled {
        let transcriber: Arc<dyn Transcriber> = if let Some(key) = &config.api_keys.openai {
            Arc::new(SpeechToText::new_whisper(key.clone(), config.stt_model.clone())?)
        } else if let Some(key) = &config.api_keys.deepgram {
            Arc::new(SpeechToText::new_deepgram(key.clone(), "nova-2".to_string())?)
        } else {
            gemini.clone()
        };
        Some(Arc::new(SpeechSegmentRecognizerFactory::new(
            Arc::clone(&audio),
            transcriber,
        )))
    } else {
        None
    };

    let tables = CommandTables::load_or_default(&config.commands_path);

    Ok(SessionServices {
        audio,
        connector: Arc::new(connector),
        assistant: gemini,
        tools: Arc::new(toolbox),
        recognizer,
        commands: LocalCommandInterceptor::new(tables),
    })
}

/// Run a session with a line-oriented console
async fn run_session(wake_enabled: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    tracing::debug!(?config, "loaded configuration");

    let services = services(&config, wake_enabled)?;
    let (session, task) = SessionHandle::spawn(config.session_config(wake_enabled), services);
    let presenter = tokio::spawn(present(session.subscribe()));

    println!("Vesper is starting. Type to chat, or use /start /stop /restart /sleep /wake [command] /interrupt /quit");
    session.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let line = line.trim();
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => Ok(()),
            ("/quit" | "/exit", _) => break,
            ("/start", _) => session.start().await,
            ("/stop", _) => session.stop().await,
            ("/restart", _) => session.restart().await,
            ("/sleep", _) => session.shutdown().await,
            ("/wake", rest) => {
                let command = (!rest.trim().is_empty()).then(|| rest.trim().to_string());
                session.wake(command).await
            }
            ("/interrupt", _) => session.interrupt().await,
            ("/levels", _) => {
                let levels = session.levels();
                println!("input {:.2}  output {:.2}", levels.input, levels.output);
                Ok(())
            }
            _ => session.send_text(line).await,
        };
        result?;
    }

    session.stop().await?;
    drop(session);
    presenter.abort();
    let _ = task.await;

    Ok(())
}

/// Print state changes and finished messages as they arrive
async fn present(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut printed: HashSet<Uuid> = HashSet::new();
    let mut last_state: Option<SessionState> = None;

    loop {
        {
            let snapshot = snapshots.borrow_and_update();

            if last_state != Some(snapshot.state) {
                println!("[{}]", snapshot.state);
                last_state = Some(snapshot.state);
            }

            for message in snapshot.messages.iter().filter(|m| !m.partial) {
                if !printed.insert(message.id) {
                    continue;
                }
                let who = match message.sender {
                    Sender::User => "you",
                    Sender::Agent => "vesper",
                    Sender::System => "system",
                };
                println!("{who}> {}", message.text);
                for source in &message.sources {
                    println!("    - {} <{}>", source.title, source.uri);
                }
                if let Some(image) = &message.image {
                    println!("    [image: {}, {} bytes]", image.mime_type, image.uri.len());
                }
            }
        }

        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut input = CpalBackend.open_input()?;
    let sample_rate = input.sample_rate();
    let meter = Arc::new(LevelMeter::new());

    let level = Arc::clone(&meter);
    input.start(Box::new(move |samples: &[f32]| {
        level.set_input(normalized_level(rms(samples)));
    }))?;

    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration * 5 {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let energy = meter.input().clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 50.0) as usize;
        let bar: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        #[allow(clippy::cast_precision_loss)]
        let seconds = (i + 1) as f32 / 5.0;
        println!("[{seconds:4.1}s] level: {energy:.3} | [{bar}]");
    }

    input.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Play `pcm` through a fresh scheduler and wait for it to finish
async fn play_and_wait(mime_type: &str, pcm: &[u8]) -> anyhow::Result<()> {
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let device = CpalBackend.open_output(ended_tx, Arc::new(LevelMeter::new()))?;
    let mut scheduler = PlaybackScheduler::new(device);

    let chunk = scheduler.decoder().decode(mime_type, pcm)?;
    let Some(source) = scheduler.enqueue(chunk)? else {
        println!("Nothing to play");
        return Ok(());
    };
    println!("Playing {:.1}s of audio...", source.duration);

    while let Some(id) = ended_rx.recv().await {
        if scheduler.source_ended(id) {
            break;
        }
    }

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let sample_rate = MODEL_OUTPUT_SAMPLE_RATE;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    play_and_wait(&pcm_mime(sample_rate), &pcm16_le(&samples)).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Speak text through the one-shot speech model
async fn say(text: &str) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let gemini = GeminiClient::new(config.api_key.clone(), config.gemini.clone());

    println!("Synthesizing speech...");
    let audio = gemini.synthesize(text).await?;

    let pcm = base64::engine::general_purpose::STANDARD.decode(&audio.data)?;
    play_and_wait(&audio.mime_type, &pcm).await
}

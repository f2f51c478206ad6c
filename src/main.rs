use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use voice_deck::{
    audio::CpalCapture,
    config::{CaptureConfig, PlaybackConfig, SessionConfig, DEFAULT_INPUT_GAIN},
    deck::{
        generator::{GeminiDeckGenerator, GeminiImageGenerator},
        DeckEditor, DeckStore, Presentation,
    },
    session::{CpalBackend, LiveSession, Role, SessionSettings, TranscriptEvent, WebSocketConnector},
    tools::ToolDispatcher,
    SessionState,
};

#[derive(Parser, Debug)]
#[command(name = "voice-deck")]
#[command(about = "Build and edit a slide deck by talking to a realtime voice agent")]
struct Args {
    /// Where the deck is saved between runs
    #[arg(long, default_value = "voice-deck.json")]
    deck_file: PathBuf,

    /// Microphone to use (default device if omitted)
    #[arg(long)]
    input_device: Option<String>,

    /// Speaker to use (default device if omitted)
    #[arg(long)]
    output_device: Option<String>,

    /// Gain applied to the microphone signal
    #[arg(long, default_value_t = DEFAULT_INPUT_GAIN)]
    gain: f32,

    /// Prebuilt voice for the agent
    #[arg(long)]
    voice: Option<String>,

    /// Print available input devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn print_slide(deck: &Presentation) {
    if let Some(slide) = deck.current() {
        println!(
            "\n📽️  {} - slide {}/{}\n{}",
            deck.title,
            deck.current_slide + 1,
            deck.slides.len(),
            slide
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        for device in CpalCapture::list_devices().context("Failed to list input devices")? {
            println!(
                "{}{} ({} channels)",
                if device.is_default { "* " } else { "  " },
                device.name,
                device.channel_count
            );
        }
        return Ok(());
    }

    let mut session_config = SessionConfig::load()?;
    if let Some(voice) = args.voice {
        session_config.voice = voice;
    }
    let capture = CaptureConfig {
        device_name: args.input_device,
        gain: args.gain,
        ..CaptureConfig::default()
    };
    capture.validate()?;
    let playback = PlaybackConfig {
        device_name: args.output_device,
        ..PlaybackConfig::default()
    };

    let store = DeckStore::new(args.deck_file);
    let deck = store.load();
    print_slide(&deck);

    let editor = DeckEditor::new(
        deck,
        store,
        Arc::new(GeminiDeckGenerator::new(session_config.api_key())?),
        Arc::new(GeminiImageGenerator::new(session_config.api_key())?),
    );
    let mut deck_changes = editor.subscribe();

    let connector = Arc::new(WebSocketConnector::new(&session_config));
    let (session, mut transcripts) = LiveSession::new(
        SessionSettings {
            session: session_config,
            capture,
            playback,
        },
        Arc::new(CpalBackend),
        connector,
        ToolDispatcher::new(Arc::new(editor.clone())),
    );
    let mut states = session.subscribe();

    log::info!("🚀 Starting voice session");
    if let Err(e) = session.start().await {
        eprintln!("❌ {}", e.user_message());
        std::process::exit(1);
    }
    println!("🎧 Listening. Describe the presentation you want. Press Ctrl+C to exit");

    let mut speaking: Option<Role> = None;
    loop {
        tokio::select! {
            Some(event) = transcripts.recv() => match event {
                TranscriptEvent::Fragment { role, text } => {
                    if speaking != Some(role) {
                        print!("\n{}: ", role);
                        speaking = Some(role);
                    }
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                TranscriptEvent::TurnComplete => {
                    println!();
                    speaking = None;
                }
            },
            Ok(()) = deck_changes.changed() => {
                let deck = deck_changes.borrow_and_update().clone();
                print_slide(&deck);
            }
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                if state == SessionState::Idle {
                    println!("\n🔌 Session ended");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                session.stop().await;
                println!("\n👋 Goodbye!");
                break;
            }
        }
    }

    Ok(())
}

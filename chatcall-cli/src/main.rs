//! Chatcall CLI Application
//!
//! Runs a loopback call between two in-process call managers so the
//! negotiation, reconnection and quality machinery can be watched end to end.

use anyhow::{Context, Result};
use chatcall_core::prelude::*;
use chatcall_core::{CallSnapshot, SampleMediaDevices};
use clap::{Parser, Subcommand};
use relay::MemoryRelay;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

mod relay;

/// Opus frame duration fed into audio tracks
const FRAME: Duration = Duration::from_millis(20);

/// Opus TOC byte for a 20ms silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Call manager configuration (JSON)
    #[arg(short, long, env = "CHATCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call between two in-process peers over a memory relay
    Loopback {
        /// Video call instead of audio
        #[arg(long)]
        video: bool,

        /// How long to keep the call up
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Skip STUN and rely on host candidates
        #[arg(long)]
        offline: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CallManagerConfig::default(),
    };

    match cli.command {
        Commands::Loopback {
            video,
            seconds,
            offline,
        } => {
            handle_loopback(config, video, seconds, offline).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<CallManagerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn handle_loopback(
    mut config: CallManagerConfig,
    video: bool,
    seconds: u64,
    offline: bool,
) -> Result<()> {
    if offline {
        config.ice_servers.clear();
    }
    let call_type = if video {
        CallType::Video
    } else {
        CallType::Audio
    };
    println!("🔁 Loopback {call_type} call for {seconds}s");

    let relay = MemoryRelay::new();
    let alice_id = PeerId::new("alice");
    let bob_id = PeerId::new("bob");
    let alice_devices = Arc::new(SampleMediaDevices::new());
    let bob_devices = Arc::new(SampleMediaDevices::new());

    let alice = CallManager::builder(relay.endpoint(alice_id.clone()), alice_id.clone())
        .with_config(config.clone())
        .with_media_devices(alice_devices.clone())
        .build()?;
    let bob = CallManager::builder(relay.endpoint(bob_id.clone()), bob_id.clone())
        .with_config(config)
        .with_media_devices(bob_devices.clone())
        .build()?;

    // Subscribe before anything can happen.
    let alice_events = alice.subscribe_events();
    let bob_events = bob.subscribe_events();

    alice.start()?;
    bob.start()?;
    alice.set_remote_peer(Some(bob_id)).await;
    bob.set_remote_peer(Some(alice_id)).await;
    println!("✅ Call managers started");

    let tasks = vec![
        spawn_event_printer("alice", alice_events, None),
        spawn_event_printer("bob", bob_events, Some(bob.clone())),
        spawn_feeder(alice_devices),
        spawn_feeder(bob_devices),
    ];

    let call_id = alice.start_call(call_type).await?;
    println!("📞 Call {call_id} started");

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    if let Some(snapshot) = alice.snapshot() {
        print_snapshot(&snapshot);
    }

    alice.end_call().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.shutdown().await;
    bob.shutdown().await;
    for task in tasks {
        task.abort();
    }

    println!("📞 Call ended");
    Ok(())
}

/// Print events; with `answer` set, accept incoming calls automatically
fn spawn_event_printer(
    who: &'static str,
    mut events: tokio::sync::broadcast::Receiver<CallEvent>,
    answer: Option<CallManager<relay::RelayEndpoint>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(who, missed, "Event printer lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            print_event(who, &event);

            if let (CallEvent::IncomingCall { .. }, Some(manager)) = (&event, &answer) {
                println!("✅ [{who}] Accepting call...");
                if let Err(e) = manager.accept_call().await {
                    println!("❌ [{who}] Accept failed: {e}");
                }
            }
        }
    })
}

fn print_event(who: &str, event: &CallEvent) {
    match event {
        CallEvent::StateChanged { state, .. } => println!("🔄 [{who}] {state:?}"),
        CallEvent::IncomingCall {
            call_type,
            from_peer,
            caller_name,
            ..
        } => println!("📞 [{who}] Incoming {call_type} call from {caller_name} ({from_peer})"),
        CallEvent::CallEnded {
            reason,
            duration_secs,
            ..
        } => match duration_secs {
            Some(secs) => println!(
                "📴 [{who}] Ended: {reason:?} after {}",
                chatcall_core::format_duration(*secs)
            ),
            None => println!("📴 [{who}] Ended: {reason:?}"),
        },
        CallEvent::QualityChanged {
            quality,
            loss_ratio,
            ..
        } => println!(
            "📶 [{who}] Quality {quality:?} ({:.1}% loss)",
            loss_ratio * 100.0
        ),
        CallEvent::Failure { failure, .. } => println!("❌ [{who}] {failure:?}"),
        CallEvent::Notice { message } => println!("ℹ️  [{who}] {message}"),
        other => println!("   [{who}] {other:?}"),
    }
}

fn print_snapshot(snapshot: &CallSnapshot) {
    println!("📊 Call {}", snapshot.call_id);
    println!(
        "   State: {:?} | Type: {} | Duration: {}",
        snapshot.state,
        snapshot.call_type,
        snapshot.formatted_duration()
    );
    println!(
        "   Quality: {:?} | Video: {} | Audio: {} | Reconnects: {}",
        snapshot.quality,
        snapshot.local_media.video,
        snapshot.local_media.audio,
        snapshot.reconnect_attempts
    );
}

/// Stand-in capture pipeline: writes a frame into every live track
fn spawn_feeder(devices: Arc<SampleMediaDevices>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME);
        loop {
            ticker.tick().await;
            for track in devices.live_tracks() {
                let frame = match track.kind() {
                    TrackKind::Audio => OPUS_SILENCE.to_vec(),
                    TrackKind::Video => vec![0u8; 64],
                };
                if let Err(e) = track.write_sample(frame, FRAME).await {
                    tracing::debug!(track = track.id(), error = %e, "Sample dropped");
                }
            }
        }
    })
}

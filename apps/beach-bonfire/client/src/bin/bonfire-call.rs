use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use beach_bonfire_client::{
    webrtc_media::write_audio_sample, CallEvent, ClientConfig, ConnectionStatus,
    ConnectionSupervisor, IceServerConfig, LocalAudio, RoomDirectory, WebRtcMediaBackend,
};
use beach_bonfire_core::{Role, RoomId, Uid};
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// One 20 ms Opus frame of digital silence.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "bonfire-call")]
#[command(about = "Join a Beach Bonfire voice room from the terminal")]
struct Cli {
    /// Signaling endpoint (e.g., ws://localhost:8080/ws)
    #[arg(long, env = "BONFIRE_SIGNALING_URL", default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Room to join; required unless --find-room is given
    #[arg(long)]
    room: Option<String>,

    /// Participant uid; random when omitted
    #[arg(long)]
    uid: Option<Uid>,

    #[arg(long, default_value = "listener")]
    role: Role,

    /// Room/participant persistence API base URL
    #[arg(long, env = "BONFIRE_DIRECTORY_URL")]
    directory_url: Option<Url>,

    /// Ask the persistence API for a room waiting for a listener
    #[arg(long, requires = "directory_url")]
    find_room: bool,
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let room_id = resolve_room(&cli).await?;
    let uid = cli
        .uid
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=u32::MAX));
    let mut config = ClientConfig::new(&cli.url, room_id, uid, cli.role)?;
    if let Some(url) = cli.directory_url.clone() {
        config = config.with_directory(url);
    }

    let backend = Arc::new(
        WebRtcMediaBackend::new(&config.ice_servers).context("initialising webrtc")?,
    );
    info!(room_id = %config.room_id, uid, role = %config.role, "joining room");
    let (supervisor, mut events) = ConnectionSupervisor::new(config, backend);
    supervisor.connect().await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut silence = tokio::time::interval(FRAME_DURATION);
    let mut capture: Option<LocalAudio> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if matches!(event, CallEvent::Status(ConnectionStatus::Error)) {
                    break;
                }
            }
            line = stdin.next_line() => match line.context("reading stdin")? {
                Some(line) => match line.trim() {
                    "mute" | "m" => {
                        let muted = supervisor.toggle_mute().await?;
                        println!("muted: {muted}");
                    }
                    "quit" | "q" => break,
                    "" => {}
                    other => println!("unknown command {other:?}; try `mute` or `quit`"),
                },
                None => break,
            },
            _ = silence.tick() => {
                if capture.is_none() {
                    capture = supervisor.local_audio().await;
                }
                if let Some(audio) = &capture {
                    if let Err(err) = write_audio_sample(audio, Bytes::from_static(&OPUS_SILENCE), FRAME_DURATION).await {
                        warn!(error = %err, "failed to write audio frame");
                    }
                }
            }
        }
    }

    supervisor.disconnect().await;
    Ok(())
}

async fn resolve_room(cli: &Cli) -> Result<RoomId> {
    if let Some(room) = &cli.room {
        return Ok(RoomId::from(room.as_str()));
    }
    if !cli.find_room {
        return Err(anyhow!("either --room or --find-room is required"));
    }
    let url = cli
        .directory_url
        .as_ref()
        .ok_or_else(|| anyhow!("--find-room needs --directory-url"))?;
    RoomDirectory::new(url)
        .find_waiting_room()
        .await
        .context("looking up a waiting room")?
        .ok_or_else(|| anyhow!("no room is waiting for a listener"))
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::Status(status) => println!("status: {status:?}"),
        CallEvent::Roster(participants) => {
            let entries: Vec<String> = participants
                .iter()
                .map(|p| {
                    let muted = if p.is_muted { " (muted)" } else { "" };
                    format!("{}:{}{muted}", p.uid, p.role)
                })
                .collect();
            println!("roster: [{}]", entries.join(", "));
        }
        CallEvent::PeerState { uid, state } => println!("peer {uid}: {state:?}"),
        CallEvent::RemoteAudio { uid, track_id } => println!("audio from {uid} ({track_id})"),
        CallEvent::PeerError(err) => println!("peer error: {err}"),
        CallEvent::Reconnecting { attempt, delay } => {
            println!("reconnecting (attempt {attempt}) in {delay:?}")
        }
        CallEvent::Error(err) => println!("error: {err}"),
    }
}

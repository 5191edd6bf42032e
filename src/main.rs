use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use meshcall::config::{
    ClientConfig, RelayConfig, DEFAULT_RELAY_ADDR, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVERS,
    MAX_ROOM_SIZE,
};
use meshcall::media::LocalMedia;
use meshcall::peer::WebRtcConnectionFactory;
use meshcall::relay::RelayServer;
use meshcall::session::{SessionCommand, SessionCoordinator, SessionEvent};
use meshcall::signaling::SignalingClient;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(name = "meshcall")]
#[command(version, about = "Room relay and headless client for small WebRTC mesh calls", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Relay(RelayArgs),
    /// Join a room and publish local tracks until Ctrl-C
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Listen address
    #[arg(short = 'b', long, value_name = "ADDRESS", default_value = DEFAULT_RELAY_ADDR)]
    bind: SocketAddr,

    /// Participants allowed in one room
    #[arg(long, value_name = "N", default_value_t = MAX_ROOM_SIZE)]
    max_room_size: usize,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Room to join
    #[arg(short = 'r', long)]
    room: String,

    /// Email shown to the other participants
    #[arg(short = 'e', long)]
    email: String,

    /// Display name
    #[arg(short = 'n', long, default_value = "")]
    name: String,

    /// Relay WebSocket URL
    #[arg(short = 'u', long, value_name = "URL", default_value = DEFAULT_RELAY_URL)]
    relay_url: String,

    /// STUN server, may be repeated (defaults to public Google and Twilio servers)
    #[arg(long = "stun", value_name = "URL")]
    stun_servers: Vec<String>,

    /// Seconds an offer may stay unanswered
    #[arg(long, value_name = "SECS", default_value_t = 15)]
    negotiation_timeout: u64,

    /// Do not publish audio
    #[arg(long)]
    no_audio: bool,

    /// Do not publish video
    #[arg(long)]
    no_video: bool,
}

impl JoinArgs {
    fn into_config(self) -> ClientConfig {
        let stun_servers = if self.stun_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.stun_servers
        };
        ClientConfig {
            relay_url: self.relay_url,
            room: self.room,
            name: self.name,
            email: self.email,
            stun_servers,
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout),
            audio: !self.no_audio,
            video: !self.no_video,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.verbose);

    match cli.command {
        Command::Relay(args) => {
            run_relay(RelayConfig {
                bind: args.bind,
                max_room_size: args.max_room_size,
            })
            .await
        }
        Command::Join(args) => run_join(args.into_config()).await,
    }
}

async fn run_relay(config: RelayConfig) -> anyhow::Result<()> {
    let server = RelayServer::bind(&config).await?;
    tracing::info!(
        "Relay listening on {} (rooms of up to {})",
        server.local_addr()?,
        config.max_room_size
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Relay shutdown complete");
    Ok(())
}

async fn run_join(config: ClientConfig) -> anyhow::Result<()> {
    config.validate()?;

    let media = match LocalMedia::open(&config) {
        Ok(media) => media,
        Err(e) => {
            tracing::error!("Cannot start call: {}", e);
            return Err(e.into());
        }
    };

    let factory = Arc::new(WebRtcConnectionFactory::new(config.stun_servers.clone())?);
    let signaling = SignalingClient::connect(&config.relay_url).await?;
    let (signaling_tx, inbound) = signaling.split();

    let (session, mut events) =
        SessionCoordinator::new(factory, signaling_tx, config.negotiation_timeout);
    let mut call_state = session.monitor().subscribe();
    let (commands, commands_rx) = mpsc::channel(16);
    let session = tokio::spawn(session.run(inbound, commands_rx));

    for track in media.tracks() {
        commands.send(SessionCommand::AddTrack(track)).await?;
    }
    commands
        .send(SessionCommand::JoinRoom {
            room: config.room.clone(),
            name: config.name.clone(),
            email: config.email.clone(),
        })
        .await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Joined { room } => tracing::info!("In room {}", room),
                    SessionEvent::RoomFull { room } => {
                        tracing::error!("Room {} is full", room);
                        let _ = commands.send(SessionCommand::EndCall).await;
                    }
                    SessionEvent::RemoteTrack { peer_id, track } => {
                        tracing::info!("Receiving {:?} track {} from {}", track.kind, track.id, peer_id);
                    }
                    SessionEvent::PeerConnectionState { peer_id, state } => {
                        tracing::info!("Peer {} is {}", peer_id, state);
                    }
                    SessionEvent::NegotiationFailed { peer_id } => {
                        tracing::warn!("Negotiation with {} failed", peer_id);
                    }
                    SessionEvent::CallEnded => tracing::info!("Call ended"),
                }
            }
            changed = call_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = call_state.borrow_and_update().clone();
                tracing::debug!(
                    "{} participant(s), muted: {}, video off: {}",
                    state.participants.len(),
                    state.is_muted,
                    state.is_video_off
                );
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                let _ = commands.send(SessionCommand::EndCall).await;
                break;
            }
        }
    }

    session.await?;
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "meshcall=error,webrtc=error",
        LogLevel::Warn => "meshcall=warn,webrtc=warn",
        LogLevel::Info => "meshcall=info,webrtc=warn",
        LogLevel::Verbose => "meshcall=debug,webrtc=warn",
        LogLevel::Debug => "meshcall=debug,webrtc=info",
        LogLevel::Trace => "meshcall=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

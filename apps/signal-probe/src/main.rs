mod config;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use call_negotiator::{
    CallSession, CallState, NegotiatorConfig, PeerFactory, RtcPeerConfig, RtcPeerFactory,
};
use clap::{Parser, Subcommand};
use crate::config::ProbeConfig;
use event_channel::{
    ChannelConfig, ChannelEvent, EventChannelManager, Listener, PushConnector, SseConnector,
};
use signal_link::{SignalLink, WebSocketLink};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "signal-probe",
    about = "Exercise the realtime notification channel and call signaling from a terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open the notification stream and print every event until Ctrl-C.
    Listen,
    /// Place a voice call over the signaling websocket, or answer one.
    Call {
        /// Wait for an incoming offer instead of placing the call.
        #[arg(long)]
        answer: bool,
        /// STUN/TURN server urls; defaults to a public STUN server.
        #[arg(long = "ice-server", env = "SIGNAL_ICE_SERVERS", value_delimiter = ',')]
        ice_servers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ProbeConfig::from_env();
    let _guard = init_tracing(cfg.log_path.as_deref())?;

    match cli.command {
        Commands::Listen => listen(&cfg).await,
        Commands::Call {
            answer,
            ice_servers,
        } => call(&cfg, answer, ice_servers).await,
    }
}

fn init_tracing(log_path: Option<&str>) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(log_path.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| anyhow!(err))?;
    Ok(guard)
}

async fn listen(cfg: &ProbeConfig) -> Result<()> {
    let base_url = cfg
        .base_url
        .as_deref()
        .context("SIGNAL_BASE_URL is required to listen")?;
    let base_url = Url::parse(base_url).context("SIGNAL_BASE_URL is not a valid url")?;
    let channel_config = ChannelConfig::new(base_url).with_reconnect(cfg.reconnect_policy());
    let connector: Arc<dyn PushConnector> = Arc::new(SseConnector::new());
    let manager = EventChannelManager::new(channel_config, connector);

    let printer: Listener = Arc::new(|event: &ChannelEvent| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "failed to render event"),
    });
    manager.add_listener(&printer);

    let mut state = manager.subscribe_state();
    manager.connect(cfg.credentials())?;
    info!(user_id = ?manager.user_id(), "listening for notifications");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(
                    state = ?current,
                    attempts = manager.reconnect_attempts(),
                    "event channel state changed"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing event channel");
                break;
            }
        }
    }
    manager.disconnect();
    Ok(())
}

async fn call(cfg: &ProbeConfig, answer: bool, ice_servers: Vec<String>) -> Result<()> {
    let ws_url = cfg
        .ws_url
        .as_deref()
        .context("SIGNAL_WS_URL is required to place or answer a call")?;
    let ws_url = Url::parse(ws_url).context("SIGNAL_WS_URL is not a valid url")?;
    let link = Arc::new(WebSocketLink::connect(ws_url).await?);
    let incoming = link
        .take_incoming()
        .ok_or_else(|| anyhow!("signaling link inbound already taken"))?;

    let rtc_config = if ice_servers.is_empty() {
        RtcPeerConfig::default()
    } else {
        RtcPeerConfig { ice_servers }
    };
    let factory: Arc<dyn PeerFactory> = Arc::new(RtcPeerFactory::new(rtc_config));
    let mut negotiator = NegotiatorConfig::default();
    if let Some(peer_id) = &cfg.peer_id {
        negotiator = negotiator.with_peer_id(peer_id);
    }
    let session = CallSession::new(negotiator, link.clone() as Arc<dyn SignalLink>, factory);
    let mut offers = session.attach(incoming);
    let mut status = session.subscribe();

    if answer {
        info!(session = %session.id(), "waiting for an incoming call");
        let offer = tokio::select! {
            offer = offers.recv() => offer,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(offer) = offer else {
            session.end().await;
            bail!("no call arrived");
        };
        session.accept_offer(offer).await?;
    } else {
        session.start().await?;
    }

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(state = ?current.state, role = ?current.role, reason = ?current.reason, "call status");
                if current.state == CallState::Terminated {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; hanging up");
                break;
            }
        }
    }
    session.end().await;
    link.close();
    Ok(())
}

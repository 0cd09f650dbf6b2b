//! Demo chat relay.
//!
//! Rebroadcasts every `Say` to all connected clients, answers `Ping`
//! requests with `Pong`, and mirrors chat lines to the multicast group when
//! one is configured.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use skein_core::{MulticastConfig, TransformChain};
use skein_proto::{ClientMessage, Codec, Message, ServerMessage};
use skein_server::{DEFAULT_PORT, Server, ServerConfig, ServerEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireCodec {
    Cbor,
    Json,
}

impl From<WireCodec> for Codec {
    fn from(codec: WireCodec) -> Self {
        match codec {
            WireCodec::Cbor => Codec::Cbor,
            WireCodec::Json => Codec::Json,
        }
    }
}

/// Skein demo relay server
#[derive(Parser, Debug)]
#[command(name = "skein-server")]
#[command(about = "Chat relay on the skein networking substrate")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Seconds between heartbeat sweeps (0 disables the sweep)
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,

    /// Multicast group to mirror chat lines to
    #[arg(long)]
    multicast_group: Option<Ipv4Addr>,

    /// Payload codec
    #[arg(long, value_enum, default_value_t = WireCodec::Cbor)]
    codec: WireCodec,

    /// Log frames and count traffic
    #[arg(long)]
    instrumented: bool,

    /// Percentage of incoming frames to drop (needs --instrumented)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=100))]
    drop_percent: u8,

    /// Delay applied to every incoming frame in milliseconds (needs --instrumented)
    #[arg(long, default_value_t = 0)]
    lag_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ChatUp {
    Say(String),
    Ping,
}

impl Message for ChatUp {}
impl ClientMessage for ChatUp {}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ChatDown {
    Said { from: u32, text: String },
    Pong,
}

impl Message for ChatDown {}
impl ServerMessage for ChatDown {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::bind(args.bind);
    config.heartbeat_interval = (args.heartbeat_secs > 0).then(|| Duration::from_secs(args.heartbeat_secs));
    config.multicast = args.multicast_group.map(MulticastConfig::new);

    let mirror = args.multicast_group.is_some();
    let codec = Codec::from(args.codec);
    let mut stats = None;
    config.transform = if args.instrumented {
        let (chain, faults, traffic) = TransformChain::instrumented(codec);
        faults.set_drop_percent(args.drop_percent);
        faults.set_lag((args.lag_ms > 0).then(|| Duration::from_millis(args.lag_ms)));
        stats = Some(traffic);
        chain
    } else {
        TransformChain::new(codec)
    };

    let (server, mut events) = Server::<ChatDown, ChatUp>::new(config);
    let local = server.host().await?;
    info!(%local, codec = ?args.codec, "relay ready");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            ServerEvent::ClientConnected { connection_id, remote } => {
                info!(%connection_id, %remote, clients = server.connection_count(), "joined");
            },
            ServerEvent::MessageReceived { connection_id, message: ChatUp::Say(text) } => {
                let line = ChatDown::Said { from: connection_id.get(), text };
                let reached = server.broadcast(&line).await;
                info!(%connection_id, reached, "relayed");
                if mirror
                    && let Err(e) = server.send_multicast_message(&line).await
                {
                    warn!(error = %e, "multicast mirror failed");
                }
            },
            ServerEvent::MessageReceived { connection_id, message: ChatUp::Ping } => {
                warn!(%connection_id, "ping sent without a request id, ignoring");
            },
            ServerEvent::RequestReceived { connection_id, request_id, message } => match message {
                ChatUp::Ping => {
                    server.answer(connection_id, request_id, &ChatDown::Pong).await;
                },
                ChatUp::Say(_) => warn!(%connection_id, request_id, "chat lines are not requests"),
            },
            ServerEvent::ConnectionLost { connection_id } => {
                info!(%connection_id, clients = server.connection_count(), "left");
            },
        }
    }

    server.close().await;
    if let Some(stats) = stats {
        info!(traffic = ?stats.snapshot(), "relay stopped");
    } else {
        info!("relay stopped");
    }
    Ok(())
}

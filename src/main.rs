use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use filament::{Addr, Config, DialOptions, ListenerEvent, MemoryHub, PeerId, Transport};

/// Local development node running on the in-process loopback engine.
/// Useful for exercising the HTTP signalling surface by hand.
#[derive(Parser, Debug)]
#[command(name = "filament")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address of the direct transport family.
    #[arg(
        short,
        long,
        default_value = "/ip4/127.0.0.1/tcp/9090/http/p2p-webrtc-direct"
    )]
    listen: String,

    /// Node role: "peer" or "relay".
    #[arg(short, long, default_value = "relay")]
    role: String,

    /// This node's peer id.
    #[arg(long, default_value = "QmLocalNode")]
    peer_id: String,

    /// Primary relay peer id (peers with signalling only).
    #[arg(long)]
    relay_peer_id: Option<String>,

    /// Address to dial once at startup.
    #[arg(short, long)]
    dial: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let hub = MemoryHub::new();
    let local = PeerId::new(args.peer_id);
    let cfg = match args.role.as_str() {
        "relay" => Config::relay(local, hub.factory()),
        "peer" => match &args.relay_peer_id {
            Some(relay) => {
                Config::peer_with_relay(local, PeerId::new(relay.clone()), hub.factory())
            }
            None => Config::peer(local, hub.factory()),
        },
        other => bail!("unknown role {other:?} (expected \"peer\" or \"relay\")"),
    };

    let transport = Transport::new(cfg)?;
    let addr: Addr = args.listen.parse().context("invalid listen address")?;
    let listener = transport.create_listener(&addr).await?;
    let mut events = listener
        .take_events()
        .await
        .context("listener events already taken")?;

    if let Some(target) = &args.dial {
        let target: Addr = target.parse().context("invalid dial address")?;
        match transport.dial(&target, DialOptions::default()).await {
            Ok(conn) => info!(remote = %conn.remote, "dial succeeded"),
            Err(e) => warn!(error = %e, "dial failed"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            event = events.recv() => match event {
                Some(ListenerEvent::Listening(addr)) => info!(addr = %addr, "listening"),
                Some(ListenerEvent::Connection(conn)) => {
                    info!(remote = %conn.remote, "inbound connection");
                }
                Some(ListenerEvent::Closed) | None => {
                    warn!("listener closed");
                    break;
                }
            },
        }
    }

    transport.close().await;
    Ok(())
}

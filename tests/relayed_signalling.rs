//! Integration tests for the signalling overlay: join, relayed connect,
//! multi-hop flooding, and dead-channel reclamation.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relayed_signalling -- --nocapture

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::broadcast;

use filament::{
    decode_message, Addr, ChannelEvent, Config, Connection, DialOptions, ListenerEvent,
    MemoryHub, PeerId, SignallingMessage, Transport, SIG_CHANNEL_LABEL,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Spin up a relay with an HTTP listener; returns its transport and the
/// announced address (embedding the relay's peer id).
async fn spawn_relay(hub: &Arc<MemoryHub>, pid: &str) -> (Transport, Addr) {
    let transport = Transport::new(Config::relay(PeerId::new(pid), hub.factory())).unwrap();
    let addr: Addr = format!(
        "/ip4/127.0.0.1/tcp/{}/http/p2p-webrtc-direct/p2p/{pid}",
        next_port()
    )
    .parse()
    .unwrap();
    let listener = transport.create_listener(&addr).await.unwrap();
    let mut events = listener.take_events().await.unwrap();
    let listening = loop {
        match events.recv().await.unwrap() {
            ListenerEvent::Listening(addr) => break addr,
            _ => continue,
        }
    };
    // Keep draining relay listener events in the background.
    tokio::spawn(async move { while events.recv().await.is_some() {} });
    (transport, listening)
}

/// Spin up a peer registered with its primary relay: a signalling
/// listener plus the HTTP dial that opens the peer signalling channel.
async fn spawn_joined_peer(
    hub: &Arc<MemoryHub>,
    pid: &str,
    relay_pid: &str,
    relay_addr: &Addr,
) -> (Transport, tokio::sync::mpsc::Receiver<ListenerEvent>) {
    let transport = Transport::new(Config::peer_with_relay(
        PeerId::new(pid),
        PeerId::new(relay_pid),
        hub.factory(),
    ))
    .unwrap();

    let mut star_addr = relay_addr.clone();
    star_addr.star = true;
    let listener = transport.create_listener(&star_addr).await.unwrap();
    let mut events = listener.take_events().await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            ListenerEvent::Listening(_) => break,
            _ => continue,
        }
    }

    transport
        .dial(relay_addr, DialOptions::default())
        .await
        .expect("peer failed to dial its relay");
    (transport, events)
}

/// Poll the relay's routing table until all expected peers joined.
async fn wait_for_peers(relay: &Transport, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = relay.routing_snapshot().await;
        let have: HashSet<String> = snapshot.peers.iter().map(|(p, _)| p.to_string()).collect();
        if expected.iter().all(|p| have.contains(*p)) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peers never joined the relay, table: {have:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn recv_message(rx: &mut broadcast::Receiver<ChannelEvent>) -> Vec<u8> {
    loop {
        match rx.recv().await.expect("channel event stream ended") {
            ChannelEvent::Message(data) => return data,
            _ => continue,
        }
    }
}

fn spawn_echo(conn: Connection) {
    tokio::spawn(async move {
        let mut rx = conn.channel.subscribe();
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::Message(data)) => {
                    if conn.channel.send(data).await.is_err() {
                        break;
                    }
                }
                Ok(ChannelEvent::Close) | Ok(ChannelEvent::Error(_)) => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Count signalling messages of each kind on a channel, in the
/// background. Counts are monotonic.
fn spawn_counter(
    mut rx: broadcast::Receiver<ChannelEvent>,
) -> Arc<(std::sync::atomic::AtomicUsize, std::sync::atomic::AtomicUsize)> {
    let counts = Arc::new((
        std::sync::atomic::AtomicUsize::new(0), // ConnectRequest
        std::sync::atomic::AtomicUsize::new(0), // ConnectResponse
    ));
    let counts2 = counts.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::Message(raw)) => match decode_message(&raw) {
                    Ok(SignallingMessage::ConnectRequest { .. }) => {
                        counts2.0.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(SignallingMessage::ConnectResponse { .. }) => {
                        counts2.1.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                },
                Ok(ChannelEvent::Close) | Err(broadcast::error::RecvError::Closed) => break,
                _ => continue,
            }
        }
    });
    counts
}

// ============================================================================
// Relayed connect through one relay
// ============================================================================

#[tokio::test]
async fn relayed_connect_with_echo_round_trip() {
    init_tracing();
    let hub = MemoryHub::new();
    let (relay, relay_addr) = spawn_relay(&hub, "QmRelay").await;

    let (p1, _p1_events) = spawn_joined_peer(&hub, "QmP1", "QmRelay", &relay_addr).await;
    let (p2, mut p2_events) = spawn_joined_peer(&hub, "QmP2", "QmRelay", &relay_addr).await;
    wait_for_peers(&relay, &["QmP1", "QmP2"]).await;

    // Observe P2's signalling channel to pin the forward count.
    let p2_sc = p2.signalling_channel().expect("p2 has no signalling channel");
    let p2_counts = spawn_counter(p2_sc.subscribe());

    // Echo whatever lands on P2.
    tokio::spawn(async move {
        while let Some(event) = p2_events.recv().await {
            if let ListenerEvent::Connection(conn) = event {
                spawn_echo(conn);
            }
        }
    });

    let star = relay_addr.with_destination(PeerId::new("QmP2"));
    let conn = tokio::time::timeout(
        Duration::from_secs(10),
        p1.dial(&star, DialOptions::default()),
    )
    .await
    .expect("relayed dial timed out")
    .expect("relayed dial failed");

    let payload = b"some data".to_vec();
    let mut rx = conn.channel.subscribe();
    conn.channel.send(payload.clone()).await.unwrap();
    assert_eq!(recv_message(&mut rx).await, payload);

    // Exactly one ConnectRequest reached P2; the seen-cache kept the
    // relay from rebroadcasting it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p2_counts.0.load(Ordering::SeqCst), 1);

    p1.close().await;
    p2.close().await;
    relay.close().await;
}

/// Pins the open-question decision: the remote address of a relayed
/// inbound connection is the listening address plus the request's `dst`.
#[tokio::test]
async fn relayed_remote_addr_uses_request_dst() {
    init_tracing();
    let hub = MemoryHub::new();
    let (relay, relay_addr) = spawn_relay(&hub, "QmRelay").await;

    let (p1, _p1_events) = spawn_joined_peer(&hub, "QmP1", "QmRelay", &relay_addr).await;
    let (p2, mut p2_events) = spawn_joined_peer(&hub, "QmP2", "QmRelay", &relay_addr).await;
    wait_for_peers(&relay, &["QmP1", "QmP2"]).await;

    let star = relay_addr.with_destination(PeerId::new("QmP2"));
    let dial = tokio::spawn({
        let star = star.clone();
        async move {
            let conn = p1.dial(&star, DialOptions::default()).await.unwrap();
            (p1, conn)
        }
    });

    let inbound = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match p2_events.recv().await.unwrap() {
                ListenerEvent::Connection(conn) => break conn,
                _ => continue,
            }
        }
    })
    .await
    .expect("no inbound connection on p2");

    assert!(inbound.remote.star);
    assert_eq!(inbound.remote.destination, Some(PeerId::new("QmP2")));

    let (p1, _conn) = dial.await.unwrap();
    p1.close().await;
    p2.close().await;
    relay.close().await;
}

// ============================================================================
// Multi-hop flood across two relays
// ============================================================================

#[tokio::test]
async fn multi_hop_flood_forwards_exactly_once_per_hop() {
    init_tracing();
    let hub = MemoryHub::new();
    let (r1, r1_addr) = spawn_relay(&hub, "QmR1").await;
    let (r2, r2_addr) = spawn_relay(&hub, "QmR2").await;

    // Connect the relays: R1 dials R2, establishing the inter-relay
    // signalling channel on both routers.
    r1.dial(&r2_addr, DialOptions::default())
        .await
        .expect("relay-to-relay dial failed");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let linked = !r1.routing_snapshot().await.relays.is_empty()
            && !r2.routing_snapshot().await.relays.is_empty();
        if linked {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay mesh never linked"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (p1, _p1_events) = spawn_joined_peer(&hub, "QmP1", "QmR1", &r1_addr).await;
    let (p2, mut p2_events) = spawn_joined_peer(&hub, "QmP2", "QmR2", &r2_addr).await;
    wait_for_peers(&r1, &["QmP1"]).await;
    wait_for_peers(&r2, &["QmP2"]).await;

    let p1_sc = p1.signalling_channel().unwrap();
    let p2_sc = p2.signalling_channel().unwrap();
    let p1_counts = spawn_counter(p1_sc.subscribe());
    let p2_counts = spawn_counter(p2_sc.subscribe());

    tokio::spawn(async move {
        while let Some(event) = p2_events.recv().await {
            if let ListenerEvent::Connection(conn) = event {
                spawn_echo(conn);
            }
        }
    });

    let star = r1_addr.with_destination(PeerId::new("QmP2"));
    let conn = tokio::time::timeout(
        Duration::from_secs(10),
        p1.dial(&star, DialOptions::default()),
    )
    .await
    .expect("multi-hop dial timed out")
    .expect("multi-hop dial failed");

    let payload = b"across the mesh".to_vec();
    let mut rx = conn.channel.subscribe();
    conn.channel.send(payload.clone()).await.unwrap();
    assert_eq!(recv_message(&mut rx).await, payload);

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The request crossed R1 → R2 → P2: P2 saw it exactly once, and it
    // never bounced back to P1.
    assert_eq!(p2_counts.0.load(Ordering::SeqCst), 1);
    assert_eq!(p1_counts.0.load(Ordering::SeqCst), 0);
    // The answer travelled the reverse path exactly once.
    assert_eq!(p1_counts.1.load(Ordering::SeqCst), 1);

    p1.close().await;
    p2.close().await;
    r1.close().await;
    r2.close().await;
}

// ============================================================================
// Dead signalling channel reclaimed
// ============================================================================

#[tokio::test]
async fn silently_closed_channel_is_reclaimed_within_the_scan_period() {
    init_tracing();
    let hub = MemoryHub::new();
    let (relay, relay_addr) = spawn_relay(&hub, "QmRelay").await;
    let (p1, _p1_events) = spawn_joined_peer(&hub, "QmP1", "QmRelay", &relay_addr).await;
    wait_for_peers(&relay, &["QmP1"]).await;

    let old_sc_id = {
        let snapshot = relay.routing_snapshot().await;
        snapshot.peers[0].1
    };

    // Kill every signalling channel without a close event: only the
    // periodic reconciliation can notice.
    hub.silence_channels(SIG_CHANNEL_LABEL);

    // Within the scan period the dead channel is out of every table. The
    // peer's own supervision may re-register on a fresh channel; the old
    // one must never come back.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    loop {
        let snapshot = relay.routing_snapshot().await;
        let old_gone = snapshot.peers.iter().all(|(_, id)| *id != old_sc_id)
            && !snapshot.relays.contains(&old_sc_id);
        if old_gone {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "dead channel still routed: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    p1.close().await;
    relay.close().await;
}

// ============================================================================
// Invariants
// ============================================================================

/// A peer id maps to exactly the channel its most recent join arrived on,
/// and a closed channel leaves every routing table.
#[tokio::test]
async fn rejoined_peer_routes_on_the_newest_channel() {
    init_tracing();
    let hub = MemoryHub::new();
    let (relay, relay_addr) = spawn_relay(&hub, "QmRelay").await;

    let (p1, _p1_events) = spawn_joined_peer(&hub, "QmP1", "QmRelay", &relay_addr).await;
    wait_for_peers(&relay, &["QmP1"]).await;
    let first = relay.routing_snapshot().await.peers[0].1;

    // A second transport claiming the same peer id: newest wins.
    let (p1b, _p1b_events) = spawn_joined_peer(&hub, "QmP1", "QmRelay", &relay_addr).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let second = loop {
        let snapshot = relay.routing_snapshot().await;
        if let Some((_, id)) = snapshot.peers.first() {
            if *id != first {
                break *id;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "re-registration never took effect"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_ne!(first, second);
    assert_eq!(relay.routing_snapshot().await.peers.len(), 1);

    p1.close().await;
    p1b.close().await;
    relay.close().await;
}

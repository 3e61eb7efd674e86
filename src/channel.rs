//! Signalling channels.
//!
//! A [`SignallingChannel`] wraps a raw data channel used solely to carry
//! signalling messages. Each one is classified at creation: a `Peer`
//! channel connects a peer to its relay, a `Relay` channel connects two
//! relays. On top of the engine's channel state it tracks the overlay
//! state machine:
//!
//! ```text
//! attached → joined  (peer channels, after JoinRequest)  → closing → closed
//!         ↘ relayed (relay channels, when added to the relay list) ↗
//! ```
//!
//! `closed` is terminal and releases every routing-table entry that
//! referenced the channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::debug;

use crate::codec::{encode_message, CodecError, SignallingMessage};
use crate::engine::{ChannelEvent, ChannelState, DataChannel, CHANNEL_CLOSED_MSG};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signalling channel closed")]
    Closed,
    #[error("signalling channel failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Who is on the far end of a signalling channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScRole {
    /// Connects a peer to its relay.
    Peer,
    /// Connects two relay nodes.
    Relay,
}

/// Overlay state of a signalling channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScState {
    Attached,
    Joined,
    Relayed,
    Closing,
    Closed,
}

pub struct SignallingChannel {
    id: u64,
    role: ScRole,
    duct: Arc<dyn DataChannel>,
    state: Mutex<ScState>,
}

impl SignallingChannel {
    pub fn new(role: ScRole, duct: Arc<dyn DataChannel>) -> Arc<Self> {
        Arc::new(Self {
            id: rand::thread_rng().gen(),
            role,
            duct,
            state: Mutex::new(ScState::Attached),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ScRole {
        self.role
    }

    pub fn duct(&self) -> &Arc<dyn DataChannel> {
        &self.duct
    }

    /// Engine-reported state of the underlying duct.
    pub fn channel_state(&self) -> ChannelState {
        self.duct.state()
    }

    pub fn is_open(&self) -> bool {
        self.duct.state() == ChannelState::Open
    }

    pub fn overlay_state(&self) -> ScState {
        *self.state.lock().expect("sc state poisoned")
    }

    /// `attached → joined`. Valid only for peer channels.
    pub fn mark_joined(&self) -> bool {
        let mut state = self.state.lock().expect("sc state poisoned");
        if self.role == ScRole::Peer && *state == ScState::Attached {
            *state = ScState::Joined;
            true
        } else {
            false
        }
    }

    /// `attached → relayed`. Valid only for relay channels.
    pub fn mark_relayed(&self) -> bool {
        let mut state = self.state.lock().expect("sc state poisoned");
        if self.role == ScRole::Relay && *state == ScState::Attached {
            *state = ScState::Relayed;
            true
        } else {
            false
        }
    }

    pub fn mark_closed(&self) {
        *self.state.lock().expect("sc state poisoned") = ScState::Closed;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.duct.subscribe()
    }

    pub async fn send_message(&self, msg: &SignallingMessage) -> Result<(), ChannelError> {
        let bytes = encode_message(msg)?;
        self.send_raw(bytes).await
    }

    /// Forward already-encoded bytes untouched, preserving the digest the
    /// seen-cache computes downstream.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        match self.duct.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string() == CHANNEL_CLOSED_MSG => Err(ChannelError::Closed),
            Err(e) => Err(ChannelError::Failed(e.to_string())),
        }
    }

    pub async fn close(&self) {
        {
            let mut state = self.state.lock().expect("sc state poisoned");
            if *state == ScState::Closed {
                return;
            }
            *state = ScState::Closing;
        }
        self.duct.close().await;
        self.mark_closed();
        debug!(sc = self.id, "signalling channel closed");
    }
}

// ============================================================================
// Connection record
// ============================================================================

/// An established application connection: the data channel carrying user
/// bytes, the remote locator, and when establishment completed. Emitted
/// only after the application channel and, when one was requested, the
/// auxiliary signalling channel have both opened.
#[derive(Clone)]
pub struct Connection {
    pub channel: Arc<dyn DataChannel>,
    pub remote: crate::addr::Addr,
    pub opened_at: std::time::Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote.to_string())
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Hands the dialer's peer signalling channel to listeners for incoming
/// use. Listeners attach a sink; a channel published before the sink was
/// attached is delivered on attachment.
pub struct ScRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    sinks: Vec<tokio::sync::mpsc::Sender<Arc<SignallingChannel>>>,
    current: Option<Arc<SignallingChannel>>,
}

impl ScRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                sinks: Vec::new(),
                current: None,
            }),
        })
    }

    pub fn publish(&self, sc: Arc<SignallingChannel>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.current = Some(sc.clone());
        inner.sinks.retain(|sink| sink.try_send(sc.clone()).is_ok());
    }

    /// Forget the channel if it is still the current one.
    pub fn retract(&self, id: u64) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner.current.as_ref().is_some_and(|sc| sc.id() == id) {
            inner.current = None;
        }
    }

    pub fn current(&self) -> Option<Arc<SignallingChannel>> {
        self.inner.lock().expect("registry poisoned").current.clone()
    }

    pub fn attach_sink(&self) -> tokio::sync::mpsc::Receiver<Arc<SignallingChannel>> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let mut inner = self.inner.lock().expect("registry poisoned");
        if let Some(sc) = &inner.current {
            let _ = tx.try_send(sc.clone());
        }
        inner.sinks.push(tx);
        rx
    }
}

// ============================================================================
// Readiness rendezvous
// ============================================================================

const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait until every channel reports `Open`, or return the first failure.
///
/// Polls the reported state rather than subscribing: each channel's
/// buffered messages belong to its long-lived consumer, and a transient
/// subscription here would steal the replay.
pub async fn all_open(channels: Vec<Arc<dyn DataChannel>>) -> Result<(), ChannelError> {
    let mut set = JoinSet::new();
    for ch in channels {
        set.spawn(wait_open(ch));
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ChannelError::Closed),
        }
    }
    Ok(())
}

async fn wait_open(ch: Arc<dyn DataChannel>) -> Result<(), ChannelError> {
    let mut interval = tokio::time::interval(OPEN_POLL_INTERVAL);
    loop {
        match ch.state() {
            ChannelState::Open => return Ok(()),
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Connecting | ChannelState::Closing => {}
        }
        interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerId;
    use crate::codec::decode_message;
    use crate::engine::{EngineEvent, PeerEngine};
    use crate::memory::MemoryHub;

    async fn open_duct_pair() -> (Arc<dyn DataChannel>, Arc<dyn DataChannel>) {
        let hub = MemoryHub::new();
        let (a, b) = hub.connected_pair().await;
        let duct_a = a.create_channel("signalling").await.unwrap();
        let mut events = b.subscribe();
        let duct_b = loop {
            match events.recv().await.unwrap() {
                EngineEvent::Channel(ch) => break ch,
                _ => continue,
            }
        };
        (duct_a, duct_b)
    }

    #[tokio::test]
    async fn peer_channel_state_machine() {
        let (duct, _far) = open_duct_pair().await;
        let sc = SignallingChannel::new(ScRole::Peer, duct);

        assert_eq!(sc.overlay_state(), ScState::Attached);
        assert!(!sc.mark_relayed(), "peer channel cannot become relayed");
        assert!(sc.mark_joined());
        assert_eq!(sc.overlay_state(), ScState::Joined);
        assert!(!sc.mark_joined(), "joined is not re-enterable");

        sc.close().await;
        assert_eq!(sc.overlay_state(), ScState::Closed);
        assert!(!sc.mark_joined(), "closed is terminal");
    }

    #[tokio::test]
    async fn relay_channel_state_machine() {
        let (duct, _far) = open_duct_pair().await;
        let sc = SignallingChannel::new(ScRole::Relay, duct);

        assert!(!sc.mark_joined(), "relay channel cannot become joined");
        assert!(sc.mark_relayed());
        assert_eq!(sc.overlay_state(), ScState::Relayed);
    }

    #[tokio::test]
    async fn send_message_is_decodable_on_the_far_end() {
        let (duct_a, duct_b) = open_duct_pair().await;
        let sc = SignallingChannel::new(ScRole::Peer, duct_a);

        let mut rx = duct_b.subscribe();
        sc.send_message(&SignallingMessage::JoinRequest {
            peer_id: PeerId::new("QmSelf"),
        })
        .await
        .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                ChannelEvent::Message(bytes) => {
                    let msg = decode_message(&bytes).unwrap();
                    assert_eq!(
                        msg,
                        SignallingMessage::JoinRequest {
                            peer_id: PeerId::new("QmSelf"),
                        }
                    );
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn send_on_closed_duct_is_a_close_not_a_failure() {
        let (duct_a, duct_b) = open_duct_pair().await;
        let sc = SignallingChannel::new(ScRole::Peer, duct_a);
        duct_b.close().await;

        let err = sc
            .send_message(&SignallingMessage::JoinRequest {
                peer_id: PeerId::new("QmSelf"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn registry_seeds_late_sinks_with_the_current_channel() {
        let (duct, _far) = open_duct_pair().await;
        let sc = SignallingChannel::new(ScRole::Peer, duct);
        let registry = ScRegistry::new();

        registry.publish(sc.clone());
        let mut sink = registry.attach_sink();
        assert_eq!(sink.recv().await.unwrap().id(), sc.id());

        registry.retract(sc.id());
        assert!(registry.current().is_none());
    }

    #[tokio::test]
    async fn all_open_resolves_once_every_channel_opens() {
        let (duct_a, duct_b) = open_duct_pair().await;
        assert!(all_open(vec![duct_a, duct_b]).await.is_ok());
    }

    #[tokio::test]
    async fn all_open_reports_the_first_failure() {
        let (duct_a, duct_b) = open_duct_pair().await;
        duct_a.close().await;
        let err = all_open(vec![duct_b]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }
}

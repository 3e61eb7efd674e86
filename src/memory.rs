//! In-process loopback implementation of the peer-engine seam.
//!
//! A [`MemoryHub`] pairs initiators and receivers living in the same
//! process: the initiator's offer carries a session token, the receiver's
//! answer echoes it, and feeding the answer back to the initiator wires
//! both engines together. Data channels become paired in-memory byte
//! ducts.
//!
//! This is the engine used by the `filament` binary and the integration
//! tests. It also exposes fault injection ([`MemoryHub::silence_channels`])
//! for exercising the health-monitor reconciliation path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::trace;

use crate::codec::{Signal, SignalKind};
use crate::engine::{
    ChannelEvent, ChannelState, DataChannel, EngineEvent, EngineFactory, EngineOptions, PeerEngine,
    CHANNEL_CLOSED_MSG,
};

const EVENT_CAPACITY: usize = 64;

/// Broadcast bus that buffers events emitted before the first subscriber,
/// replaying them in order on first subscription. Keeps the
/// subscribe-then-act contract honest even when the two sides race.
struct EventBus<T: Clone> {
    inner: Mutex<BusInner<T>>,
}

struct BusInner<T> {
    tx: broadcast::Sender<T>,
    pending: VecDeque<T>,
    subscribed: bool,
}

impl<T: Clone> EventBus<T> {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(BusInner {
                tx,
                pending: VecDeque::new(),
                subscribed: false,
            }),
        }
    }

    fn emit(&self, event: T) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        if inner.subscribed {
            let _ = inner.tx.send(event);
        } else {
            inner.pending.push_back(event);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<T> {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let rx = inner.tx.subscribe();
        if !inner.subscribed {
            inner.subscribed = true;
            while let Some(event) = inner.pending.pop_front() {
                let _ = inner.tx.send(event);
            }
        }
        rx
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Registry pairing loopback engines by session token.
pub struct MemoryHub {
    pending: Mutex<HashMap<u64, Arc<MemoryEngine>>>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Engine factory backed by this hub.
    pub fn factory(self: &Arc<Self>) -> Arc<MemoryEngineFactory> {
        Arc::new(MemoryEngineFactory { hub: self.clone() })
    }

    pub fn initiator(self: &Arc<Self>) -> Arc<MemoryEngine> {
        MemoryEngine::new(self.clone(), true)
    }

    pub fn receiver(self: &Arc<Self>) -> Arc<MemoryEngine> {
        MemoryEngine::new(self.clone(), false)
    }

    /// Two engines wired together directly, bypassing the offer/answer
    /// exchange. Test helper.
    pub async fn connected_pair(self: &Arc<Self>) -> (Arc<MemoryEngine>, Arc<MemoryEngine>) {
        let a = self.initiator();
        let b = self.receiver();
        MemoryEngine::connect(&a, &b);
        (a, b)
    }

    /// Fault injection: transition every live channel with the given label
    /// to `Closed` without emitting a close event, mimicking an engine
    /// that lost the event.
    pub fn silence_channels(&self, label: &str) {
        let channels = self.channels.lock().expect("hub poisoned");
        for weak in channels.iter() {
            if let Some(ch) = weak.upgrade() {
                if ch.label == label {
                    ch.silent_close();
                }
            }
        }
    }

    /// Offers emitted but not yet answered. Useful for asserting that
    /// cancelled dials tore their half-built engine down.
    pub fn pending_sessions(&self) -> usize {
        self.pending.lock().expect("hub poisoned").len()
    }

    fn track(&self, ch: &Arc<MemoryChannel>) {
        let mut channels = self.channels.lock().expect("hub poisoned");
        channels.retain(|w| w.strong_count() > 0);
        channels.push(Arc::downgrade(ch));
    }
}

/// [`EngineFactory`] producing loopback engines.
pub struct MemoryEngineFactory {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl EngineFactory for MemoryEngineFactory {
    async fn initiator(&self, _opts: &EngineOptions) -> Result<Arc<dyn PeerEngine>> {
        Ok(self.hub.initiator() as Arc<dyn PeerEngine>)
    }

    async fn receiver(&self, _opts: &EngineOptions) -> Result<Arc<dyn PeerEngine>> {
        Ok(self.hub.receiver() as Arc<dyn PeerEngine>)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct MemoryEngine {
    hub: Arc<MemoryHub>,
    self_ref: Weak<MemoryEngine>,
    initiator: bool,
    token: Mutex<Option<u64>>,
    peer: Mutex<Weak<MemoryEngine>>,
    connected: AtomicBool,
    closed: AtomicBool,
    negotiated: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    events: EventBus<EngineEvent>,
}

impl MemoryEngine {
    fn new(hub: Arc<MemoryHub>, initiator: bool) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            hub,
            self_ref: self_ref.clone(),
            initiator,
            token: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            negotiated: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            events: EventBus::new(),
        })
    }

    /// Wire two engines together: set peer links, mark connected, emit
    /// `Ready` on both, and pair every channel created so far.
    fn connect(a: &Arc<MemoryEngine>, b: &Arc<MemoryEngine>) {
        *a.peer.lock().expect("engine poisoned") = Arc::downgrade(b);
        *b.peer.lock().expect("engine poisoned") = Arc::downgrade(a);
        a.connected.store(true, Ordering::SeqCst);
        b.connected.store(true, Ordering::SeqCst);

        let pending_a: Vec<_> = a
            .channels
            .lock()
            .expect("engine poisoned")
            .iter()
            .filter(|ch| ch.state() == ChannelState::Connecting)
            .cloned()
            .collect();
        for ch in pending_a {
            Self::pair_channel(a, b, &ch);
        }
        let pending_b: Vec<_> = b
            .channels
            .lock()
            .expect("engine poisoned")
            .iter()
            .filter(|ch| ch.state() == ChannelState::Connecting)
            .cloned()
            .collect();
        for ch in pending_b {
            Self::pair_channel(b, a, &ch);
        }

        a.events.emit(EngineEvent::Ready);
        b.events.emit(EngineEvent::Ready);
    }

    /// Create the mirrored half of `ch` on `remote` and open both ends.
    fn pair_channel(local: &Arc<MemoryEngine>, remote: &Arc<MemoryEngine>, ch: &Arc<MemoryChannel>) {
        let mirrored = MemoryChannel::new(&ch.label, ChannelState::Open);
        local.hub.track(&mirrored);
        *ch.peer.lock().expect("channel poisoned") = Arc::downgrade(&mirrored);
        *mirrored.peer.lock().expect("channel poisoned") = Arc::downgrade(ch);
        remote
            .channels
            .lock()
            .expect("engine poisoned")
            .push(mirrored.clone());
        remote
            .events
            .emit(EngineEvent::Channel(mirrored as Arc<dyn DataChannel>));
        ch.set_open();
        trace!(label = %ch.label, "paired loopback channel");
    }

    fn peer_engine(&self) -> Option<Arc<MemoryEngine>> {
        self.peer.lock().expect("engine poisoned").upgrade()
    }
}

#[async_trait]
impl PeerEngine for MemoryEngine {
    async fn feed_signal(&self, signal: Signal) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("engine closed");
        }
        match signal.kind {
            SignalKind::Offer => {
                if self.initiator {
                    bail!("initiator fed an offer");
                }
                let token: u64 = std::str::from_utf8(&signal.payload)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .context("offer payload is not a loopback session token")?;
                let origin = self
                    .hub
                    .pending
                    .lock()
                    .expect("hub poisoned")
                    .remove(&token)
                    .context("no pending loopback session for offer")?;
                *self.token.lock().expect("engine poisoned") = Some(token);
                *self.peer.lock().expect("engine poisoned") = Arc::downgrade(&origin);
                *origin.peer.lock().expect("engine poisoned") = self.self_ref.clone();
                self.events.emit(EngineEvent::Signal(Signal::new(
                    SignalKind::Answer,
                    token.to_string().into_bytes(),
                )));
                Ok(())
            }
            SignalKind::Answer => {
                if !self.initiator {
                    bail!("receiver fed an answer");
                }
                if self.connected.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let token: u64 = std::str::from_utf8(&signal.payload)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .context("answer payload is not a loopback session token")?;
                let own = *self.token.lock().expect("engine poisoned");
                if own != Some(token) {
                    bail!("answer token does not match this session");
                }
                let this = self.self_ref.upgrade().context("engine dropped")?;
                let peer = self.peer_engine().context("loopback peer gone")?;
                MemoryEngine::connect(&this, &peer);
                Ok(())
            }
            // Candidates carry no information in the loopback engine.
            SignalKind::Candidate => Ok(()),
        }
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("engine closed");
        }
        let ch = MemoryChannel::new(label, ChannelState::Connecting);
        self.hub.track(&ch);
        self.channels
            .lock()
            .expect("engine poisoned")
            .push(ch.clone());

        if self.connected.load(Ordering::SeqCst) {
            let this = self.self_ref.upgrade().context("engine dropped")?;
            let peer = self.peer_engine().context("loopback peer gone")?;
            MemoryEngine::pair_channel(&this, &peer, &ch);
        } else if self.initiator && !self.negotiated.swap(true, Ordering::SeqCst) {
            let token: u64 = rand::thread_rng().gen();
            *self.token.lock().expect("engine poisoned") = Some(token);
            let this = self.self_ref.upgrade().context("engine dropped")?;
            self.hub
                .pending
                .lock()
                .expect("hub poisoned")
                .insert(token, this);
            self.events.emit(EngineEvent::Signal(Signal::new(
                SignalKind::Offer,
                token.to_string().into_bytes(),
            )));
        }
        Ok(ch as Arc<dyn DataChannel>)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = *self.token.lock().expect("engine poisoned") {
            self.hub
                .pending
                .lock()
                .expect("hub poisoned")
                .remove(&token);
        }
        let channels: Vec<_> = self
            .channels
            .lock()
            .expect("engine poisoned")
            .drain(..)
            .collect();
        for ch in channels {
            ch.close_both_ends();
        }
        self.events.emit(EngineEvent::Closed);
    }
}

// ============================================================================
// Channel
// ============================================================================

pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MemoryChannel>>,
    bus: EventBus<ChannelEvent>,
}

impl MemoryChannel {
    fn new(label: &str, state: ChannelState) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(state),
            peer: Mutex::new(Weak::new()),
            bus: EventBus::new(),
        })
    }

    fn set_open(&self) {
        *self.state.lock().expect("channel poisoned") = ChannelState::Open;
        self.bus.emit(ChannelEvent::Open);
    }

    /// Close without emitting events. Fault injection only.
    fn silent_close(&self) {
        *self.state.lock().expect("channel poisoned") = ChannelState::Closed;
    }

    fn close_local(&self) {
        let mut state = self.state.lock().expect("channel poisoned");
        if *state == ChannelState::Closed {
            return;
        }
        *state = ChannelState::Closed;
        drop(state);
        self.bus.emit(ChannelEvent::Close);
    }

    fn close_both_ends(&self) {
        self.close_local();
        if let Some(peer) = self.peer.lock().expect("channel poisoned").upgrade() {
            peer.close_local();
        }
    }

    fn deliver(&self, data: Vec<u8>) -> Result<()> {
        if self.state() != ChannelState::Open {
            bail!(CHANNEL_CLOSED_MSG);
        }
        self.bus.emit(ChannelEvent::Message(data));
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel poisoned")
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.bus.subscribe()
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.state() != ChannelState::Open {
            bail!(CHANNEL_CLOSED_MSG);
        }
        let peer = self
            .peer
            .lock()
            .expect("channel poisoned")
            .upgrade()
            .context(CHANNEL_CLOSED_MSG)?;
        peer.deliver(data)
    }

    async fn close(&self) {
        self.close_both_ends();
    }
}

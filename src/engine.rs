//! Peer-engine trait seam.
//!
//! The interactive connection-establishment library that produces
//! offers/answers and raw data channels is an external collaborator. This
//! module defines the exact capability set the core consumes from it:
//! create-initiator, create-receiver, feed-signal, the local-signal /
//! ready / error events, close, and auxiliary channel creation.
//!
//! Traits are defined separately from implementations so engines can be
//! swapped without touching the dial/listen machinery; the in-process
//! loopback implementation lives in [`crate::memory`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::codec::Signal;

/// Channel label used for application bytes.
pub const APP_CHANNEL_LABEL: &str = "data";

/// Error message engines use when a send races a closed channel. Treated
/// as a normal close, not a failure.
pub const CHANNEL_CLOSED_MSG: &str = "Transport channel closed";

/// Channel label used for the auxiliary signalling channel.
pub const SIG_CHANNEL_LABEL: &str = "signalling";

/// Reported state of a data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events emitted by a data channel.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Open,
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// A reliable, ordered, bidirectional byte-message duct.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Current reported state. The health monitor relies on this being
    /// accurate even when the close event failed to fire.
    fn state(&self) -> ChannelState;

    /// Subscribe to channel events. Messages delivered before the first
    /// subscription are buffered and replayed to it, preserving order.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn send(&self, data: Vec<u8>) -> Result<()>;

    async fn close(&self);
}

/// Events emitted by a peer engine instance.
#[derive(Clone)]
pub enum EngineEvent {
    /// A locally generated signal that must be delivered to the remote.
    Signal(Signal),
    /// The connection is established.
    Ready,
    /// The remote opened a data channel.
    Channel(Arc<dyn DataChannel>),
    /// Engine-level failure; the connection is unusable.
    Error(String),
    Closed,
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Signal(s) => f.debug_tuple("Signal").field(&s.kind).finish(),
            EngineEvent::Ready => f.write_str("Ready"),
            EngineEvent::Channel(c) => f.debug_tuple("Channel").field(&c.label()).finish(),
            EngineEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            EngineEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// One half of an interactive offer/answer connection attempt.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Feed a signal received from the remote side.
    async fn feed_signal(&self, signal: Signal) -> Result<()>;

    /// Create a data channel on this connection. On the initiator this
    /// triggers negotiation; the remote side observes the channel via
    /// [`EngineEvent::Channel`].
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Subscribe to engine events. Only events emitted after the call are
    /// observed; subscribe before feeding signals or creating channels.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Whether the underlying connection has been closed or failed.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Opaque option bag passed through to the engine.
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    pub params: HashMap<String, String>,
}

/// Produces engine instances for outbound (initiator) and inbound
/// (receiver) establishment.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn initiator(&self, opts: &EngineOptions) -> Result<Arc<dyn PeerEngine>>;
    async fn receiver(&self, opts: &EngineOptions) -> Result<Arc<dyn PeerEngine>>;
}

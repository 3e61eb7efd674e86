//! # Filament - Peer-to-Peer Transport with Relayed Signalling
//!
//! Filament establishes direct datagram connections between endpoints
//! through an interactive offer/answer exchange, with two establishment
//! paths:
//!
//! - **HTTP bootstrap**: a listening node accepts a base58-wrapped offer
//!   over a short HTTP request and returns the answer, yielding a direct
//!   peer-to-peer connection.
//! - **Relayed signalling**: when two endpoints cannot reach each other
//!   over HTTP, a relay node forwards their offer/answer traffic over
//!   pre-existing signalling channels, and the resulting connection then
//!   bypasses the relay entirely.
//!
//! ## Architecture
//!
//! The relay router uses the actor pattern: a cheap-to-clone handle sends
//! commands to a task owning all routing state. Everything else is plain
//! tasks communicating over channels.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `transport` | Facade: role configuration, dial/listen, address filter |
//! | `dial` | Outbound establishment and signalling-channel supervision |
//! | `listen` | Inbound establishment: HTTP server and signalling listener |
//! | `router` | Relay-side routing tables, forwarding, flooding |
//! | `channel` | Signalling-channel wrapper and its state machine |
//! | `codec` | Wire format of signalling messages and envelopes |
//! | `seen` | Time-bounded digest cache suppressing rebroadcast loops |
//! | `monitor` | Reclamation of channels that closed without an event |
//! | `engine` | Trait seam to the external peer engine |
//! | `memory` | In-process loopback engine for tests and local runs |
//! | `addr` | Locator parsing and peer identity |

mod addr;
mod channel;
mod codec;
mod dial;
mod engine;
mod listen;
mod memory;
mod monitor;
mod router;
mod seen;
mod transport;

pub use addr::{Addr, HostProto, PeerId};
pub use channel::{all_open, ChannelError, Connection, ScRole, ScState, SignallingChannel};
pub use codec::{
    decode_message, decode_signal, encode_message, encode_signal, from_base58, to_base58,
    CodecError, ScKind, Signal, SignalKind, SignallingMessage,
};
pub use dial::{DialError, DialOptions};
pub use engine::{
    ChannelEvent, ChannelState, DataChannel, EngineEvent, EngineFactory, EngineOptions,
    PeerEngine, APP_CHANNEL_LABEL, SIG_CHANNEL_LABEL,
};
pub use listen::{ListenError, Listener, ListenerEvent, CLOSE_TIMEOUT};
pub use memory::{MemoryEngine, MemoryEngineFactory, MemoryHub};
pub use monitor::{ChannelMonitor, CHANNEL_CLOSED_TIMEOUT};
pub use router::{RelayRouter, RouterSnapshot};
pub use seen::{SeenCache, SEEN_TTL};
pub use transport::{Config, FilterMode, NodeType, Transport};

//! Transport facade.
//!
//! A [`Transport`] ties the dial engine, the listeners, and (in relay
//! role) the router together, owning their lifetimes. The facade also
//! applies the address compatibility filter: only locators of the direct
//! family are usable, star-marked locators additionally require the
//! signalling overlay, and a star listen address must embed the primary
//! relay's peer id.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::addr::{Addr, PeerId};
use crate::channel::{Connection, ScRegistry, SignallingChannel};
use crate::dial::{DialError, DialOptions, Dialer};
use crate::engine::{EngineFactory, EngineOptions};
use crate::listen::{ListenCtx, ListenError, Listener};
use crate::router::RelayRouter;

/// Role of a node in the signalling overlay. Fixed at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeType {
    #[default]
    Peer,
    Relay,
}

/// Transport configuration.
#[derive(Clone)]
pub struct Config {
    /// Turns on the signalling-channel paths.
    pub signalling_enabled: bool,
    pub node_type: NodeType,
    /// This node's own peer id, announced in `JoinRequest` and used as
    /// the `src` of relayed offers.
    pub local_peer_id: PeerId,
    /// Peer id of the primary relay. Required when signalling is enabled
    /// on a peer.
    pub relay_peer_id: Option<PeerId>,
    pub engine: Arc<dyn EngineFactory>,
    pub initiator_options: EngineOptions,
    pub receiver_options: EngineOptions,
}

impl Config {
    /// Plain peer with the overlay disabled.
    pub fn peer(local_peer_id: PeerId, engine: Arc<dyn EngineFactory>) -> Self {
        Self {
            signalling_enabled: false,
            node_type: NodeType::Peer,
            local_peer_id,
            relay_peer_id: None,
            engine,
            initiator_options: EngineOptions::default(),
            receiver_options: EngineOptions::default(),
        }
    }

    /// Peer registered with a primary relay.
    pub fn peer_with_relay(
        local_peer_id: PeerId,
        relay_peer_id: PeerId,
        engine: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            signalling_enabled: true,
            relay_peer_id: Some(relay_peer_id),
            ..Self::peer(local_peer_id, engine)
        }
    }

    /// Relay node.
    pub fn relay(local_peer_id: PeerId, engine: Arc<dyn EngineFactory>) -> Self {
        Self {
            signalling_enabled: true,
            node_type: NodeType::Relay,
            ..Self::peer(local_peer_id, engine)
        }
    }
}

/// Which side of the filter an address list is checked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    Dial,
    Listen,
}

pub struct Transport {
    cfg: Arc<Config>,
    dialer: Arc<Dialer>,
    router: Option<RelayRouter>,
    registry: Arc<ScRegistry>,
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl Transport {
    /// Must be called from within a tokio runtime: the relay router is an
    /// actor task.
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.signalling_enabled
            && cfg.node_type == NodeType::Peer
            && cfg.relay_peer_id.is_none()
        {
            bail!("relay peer id is required when signalling is enabled on a peer");
        }

        let cfg = Arc::new(cfg);
        let router = (cfg.node_type == NodeType::Relay).then(RelayRouter::spawn);
        let registry = ScRegistry::new();
        let dialer = Dialer::new(cfg.clone(), registry.clone(), router.clone());

        info!(
            peer = %cfg.local_peer_id,
            role = ?cfg.node_type,
            signalling = cfg.signalling_enabled,
            "transport created"
        );
        Ok(Self {
            cfg,
            dialer,
            router,
            registry,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.cfg.local_peer_id
    }

    /// The dialer's current peer signalling channel, if open.
    pub fn signalling_channel(&self) -> Option<Arc<SignallingChannel>> {
        self.dialer.signalling_channel()
    }

    /// Routing state of the relay router. Empty on a peer.
    pub async fn routing_snapshot(&self) -> crate::router::RouterSnapshot {
        match &self.router {
            Some(router) => router.snapshot().await,
            None => Default::default(),
        }
    }

    pub async fn dial(&self, addr: &Addr, opts: DialOptions) -> Result<Connection, DialError> {
        self.dialer.dial(addr, opts).await
    }

    pub async fn create_listener(&self, addr: &Addr) -> Result<Arc<Listener>, ListenError> {
        if !self.acceptable(addr, FilterMode::Listen) {
            return Err(ListenError::Address(format!(
                "address {addr} rejected by the compatibility filter"
            )));
        }
        let listener = Listener::bind(
            addr,
            ListenCtx {
                cfg: self.cfg.clone(),
                router: self.router.clone(),
                registry: self.registry.clone(),
            },
        )
        .await?;
        let listener = Arc::new(listener);
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener.clone());
        Ok(listener)
    }

    /// Keep only the addresses this transport can use.
    pub fn filter_addrs(&self, addrs: &[Addr], mode: FilterMode) -> Vec<Addr> {
        addrs
            .iter()
            .filter(|addr| self.acceptable(addr, mode))
            .cloned()
            .collect()
    }

    fn acceptable(&self, addr: &Addr, mode: FilterMode) -> bool {
        // Parsing already guarantees the direct family.
        if addr.star {
            if !self.cfg.signalling_enabled {
                return false;
            }
            if mode == FilterMode::Listen
                && addr.owner.as_ref() != self.cfg.relay_peer_id.as_ref()
            {
                return false;
            }
        }
        true
    }

    /// Tear down every listener, the router, and the dialer's signalling
    /// channel.
    pub async fn close(&self) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .expect("listener list poisoned")
            .drain(..)
            .collect();
        for listener in listeners {
            listener.close().await;
        }
        if let Some(router) = &self.router {
            router.quit().await;
        }
        self.dialer.close().await;
        debug!(peer = %self.cfg.local_peer_id, "transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;

    fn parse(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn peer_with_signalling_requires_a_relay_peer_id() {
        let hub = MemoryHub::new();
        let cfg = Config {
            signalling_enabled: true,
            relay_peer_id: None,
            ..Config::peer(PeerId::new("QmSelf"), hub.factory())
        };
        assert!(Transport::new(cfg).is_err());
    }

    #[tokio::test]
    async fn relay_does_not_require_a_relay_peer_id() {
        let hub = MemoryHub::new();
        assert!(Transport::new(Config::relay(PeerId::new("QmR"), hub.factory())).is_ok());
    }

    #[tokio::test]
    async fn filter_accepts_direct_addresses_in_both_modes() {
        let hub = MemoryHub::new();
        let transport =
            Transport::new(Config::peer(PeerId::new("QmSelf"), hub.factory())).unwrap();
        let addrs = [parse("/ip4/127.0.0.1/tcp/9000/http/p2p-webrtc-direct")];

        assert_eq!(transport.filter_addrs(&addrs, FilterMode::Dial).len(), 1);
        assert_eq!(transport.filter_addrs(&addrs, FilterMode::Listen).len(), 1);
    }

    #[tokio::test]
    async fn filter_drops_star_addresses_when_signalling_is_disabled() {
        let hub = MemoryHub::new();
        let transport =
            Transport::new(Config::peer(PeerId::new("QmSelf"), hub.factory())).unwrap();
        let addrs =
            [parse("/ip4/127.0.0.1/tcp/9000/http/p2p-webrtc-direct/p2p/QmR/p2p-webrtc-star")];

        assert!(transport.filter_addrs(&addrs, FilterMode::Dial).is_empty());
        assert!(transport.filter_addrs(&addrs, FilterMode::Listen).is_empty());
    }

    #[tokio::test]
    async fn star_listen_address_must_embed_the_primary_relay() {
        let hub = MemoryHub::new();
        let transport = Transport::new(Config::peer_with_relay(
            PeerId::new("QmSelf"),
            PeerId::new("QmRelay"),
            hub.factory(),
        ))
        .unwrap();

        let matching =
            [parse("/ip4/127.0.0.1/tcp/9000/http/p2p-webrtc-direct/p2p/QmRelay/p2p-webrtc-star")];
        let foreign =
            [parse("/ip4/127.0.0.1/tcp/9000/http/p2p-webrtc-direct/p2p/QmOther/p2p-webrtc-star")];

        assert_eq!(
            transport.filter_addrs(&matching, FilterMode::Listen).len(),
            1
        );
        assert!(transport.filter_addrs(&foreign, FilterMode::Listen).is_empty());
        // Dialling through a foreign relay's listener is still acceptable.
        assert_eq!(transport.filter_addrs(&foreign, FilterMode::Dial).len(), 1);
    }

    #[tokio::test]
    async fn create_listener_applies_the_filter() {
        let hub = MemoryHub::new();
        let transport =
            Transport::new(Config::peer(PeerId::new("QmSelf"), hub.factory())).unwrap();
        let star = parse("/ip4/127.0.0.1/tcp/0/http/p2p-webrtc-direct/p2p/QmR/p2p-webrtc-star");

        let err = transport.create_listener(&star).await.unwrap_err();
        assert!(matches!(err, ListenError::Address(_)));
    }
}

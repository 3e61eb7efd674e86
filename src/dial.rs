//! Outbound connection establishment.
//!
//! A dial takes one of two paths, chosen from the target address and the
//! node configuration:
//!
//! | signalling | star marker | relation to primary relay | path |
//! |------------|-------------|---------------------------|------|
//! | disabled | yes | any | rejected |
//! | disabled | no | any | HTTP, no signalling channel |
//! | enabled | yes | any | signalling channel to the primary relay |
//! | enabled, peer | no | target is the primary relay | HTTP + open a peer signalling channel |
//! | enabled, peer | no | target is any other peer | HTTP, no signalling channel |
//! | enabled, relay | no | any | HTTP + open a relay signalling channel |
//!
//! On the HTTP path the first locally emitted offer is sent base58-encoded
//! to the listener's endpoint and the response body, when non-empty, is
//! fed back as the answer. On the signalling path the offer travels as a
//! `ConnectRequest` over the already-open channel to the primary relay and
//! the dial awaits the matching `ConnectResponse`.
//!
//! The peer signalling channel is supervised: a `JoinRequest` is sent the
//! moment it opens, the channel is handed to the local listeners for
//! incoming use, and when it dies while the parent connection is still
//! alive a replacement is opened on the same connection.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::channel::{
    all_open, ChannelError, Connection, ScRegistry, ScRole, SignallingChannel,
};
use crate::codec::{
    decode_message, decode_signal, encode_signal, from_base58, to_base58, CodecError, ScKind,
    Signal, SignalKind, SignallingMessage,
};
use crate::engine::{
    ChannelEvent, DataChannel, EngineEvent, PeerEngine, APP_CHANNEL_LABEL, CHANNEL_CLOSED_MSG,
    SIG_CHANNEL_LABEL,
};
use crate::monitor::ChannelMonitor;
use crate::router::RelayRouter;
use crate::transport::{Config, NodeType};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial aborted by caller")]
    Aborted,
    #[error("address requires the signalling overlay, which is disabled")]
    RejectedAddress,
    #[error("no open signalling channel to the primary relay")]
    RelayUnavailable,
    #[error("unusable address: {0}")]
    Address(String),
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Per-dial options.
#[derive(Clone, Debug, Default)]
pub struct DialOptions {
    /// Cancels the dial at any suspension point: listeners are removed,
    /// the half-built engine is closed, and the dial rejects with
    /// [`DialError::Aborted`].
    pub cancel: CancellationToken,
}

/// The dialer's peer signalling channel together with the engine whose
/// connection carries it, kept for reopening.
struct PeerScSlot {
    sc: Arc<SignallingChannel>,
    engine: Arc<dyn PeerEngine>,
}

pub struct Dialer {
    cfg: Arc<Config>,
    http: reqwest::Client,
    registry: Arc<ScRegistry>,
    router: Option<RelayRouter>,
    /// Single-writer: only dial/supervision tasks replace it. Concurrent
    /// dials to different targets share the channel stored here.
    slot: Mutex<Option<PeerScSlot>>,
    self_ref: Weak<Dialer>,
}

impl Dialer {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<ScRegistry>,
        router: Option<RelayRouter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            http: reqwest::Client::new(),
            registry,
            router,
            slot: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Close the peer signalling channel and its parent connection.
    pub async fn close(&self) {
        let slot = self.slot.lock().expect("dialer slot poisoned").take();
        if let Some(slot) = slot {
            self.registry.retract(slot.sc.id());
            // Closing the parent engine first rules out a reopen race in
            // the supervisor.
            slot.engine.close().await;
            slot.sc.close().await;
        }
    }

    /// The current peer signalling channel, if one is open.
    pub fn signalling_channel(&self) -> Option<Arc<SignallingChannel>> {
        self.slot
            .lock()
            .expect("dialer slot poisoned")
            .as_ref()
            .map(|slot| slot.sc.clone())
    }

    pub async fn dial(&self, addr: &Addr, opts: DialOptions) -> Result<Connection, DialError> {
        let cancel = opts.cancel;
        if cancel.is_cancelled() {
            return Err(DialError::Aborted);
        }

        if addr.star {
            if !self.cfg.signalling_enabled {
                return Err(DialError::RejectedAddress);
            }
            return self.dial_signalling(addr, &cancel).await;
        }
        if !self.cfg.signalling_enabled {
            return self.dial_http(addr, ScKind::None, &cancel).await;
        }
        match self.cfg.node_type {
            NodeType::Relay => self.dial_http(addr, ScKind::Relay, &cancel).await,
            NodeType::Peer => {
                let target_is_relay = addr
                    .owner
                    .as_ref()
                    .is_some_and(|pid| Some(pid) == self.cfg.relay_peer_id.as_ref());
                let kind = if target_is_relay {
                    ScKind::Peer
                } else {
                    ScKind::None
                };
                self.dial_http(addr, kind, &cancel).await
            }
        }
    }

    // ------------------------------------------------------------------
    // HTTP path
    // ------------------------------------------------------------------

    async fn dial_http(
        &self,
        addr: &Addr,
        kind: ScKind,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        let engine = self
            .cfg
            .engine
            .initiator(&self.cfg.initiator_options)
            .await
            .map_err(|e| DialError::Engine(e.to_string()))?;
        let result = self.drive_http(&engine, addr, kind, cancel).await;
        if result.is_err() {
            engine.close().await;
        }
        result
    }

    async fn drive_http(
        &self,
        engine: &Arc<dyn PeerEngine>,
        addr: &Addr,
        kind: ScKind,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        let mut events = engine.subscribe();
        let app = engine
            .create_channel(APP_CHANNEL_LABEL)
            .await
            .map_err(|e| DialError::Engine(e.to_string()))?;
        let sig = match kind {
            ScKind::None => None,
            _ => Some(
                engine
                    .create_channel(SIG_CHANNEL_LABEL)
                    .await
                    .map_err(|e| DialError::Engine(e.to_string()))?,
            ),
        };

        let offer = wait_local_offer(&mut events, cancel).await?;
        let url = format!(
            "{}?signal={}&signalling_channel={}",
            addr.http_url(),
            to_base58(&encode_signal(&offer)?),
            kind.as_str()
        );
        trace!(url = %url, "sending offer over http");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            res = self.http.get(&url).send() => {
                res.map_err(|e| DialError::Http(e.to_string()))?
            }
        };
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            body = response.text() => body.map_err(|e| DialError::Http(e.to_string()))?,
        };

        // An empty body keeps the attempt alive: the listener produced no
        // answer yet, and locally gathered candidates are not forwarded.
        if !body.trim().is_empty() {
            let answer = decode_signal(&from_base58(&body)?)?;
            engine
                .feed_signal(answer)
                .await
                .map_err(|e| DialError::Engine(e.to_string()))?;
        }

        wait_ready(&mut events, cancel).await?;
        let mut open = vec![app.clone()];
        open.extend(sig.iter().cloned());
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            res = all_open(open) => res?,
        }

        if let Some(duct) = sig {
            match kind {
                ScKind::Peer => self.adopt_peer_sc(engine.clone(), duct).await?,
                ScKind::Relay => {
                    let sc = SignallingChannel::new(ScRole::Relay, duct);
                    if let Some(router) = &self.router {
                        router.attach(sc).await;
                    }
                }
                ScKind::None => {}
            }
        }

        Ok(Connection {
            channel: app,
            remote: addr.clone(),
            opened_at: Instant::now(),
        })
    }

    // ------------------------------------------------------------------
    // Signalling-channel path
    // ------------------------------------------------------------------

    async fn dial_signalling(
        &self,
        addr: &Addr,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        let target = addr
            .destination
            .clone()
            .ok_or_else(|| DialError::Address("star address without destination peer".into()))?;
        let sc = self
            .signalling_channel()
            .filter(|sc| sc.is_open())
            .ok_or(DialError::RelayUnavailable)?;

        let engine = self
            .cfg
            .engine
            .initiator(&self.cfg.initiator_options)
            .await
            .map_err(|e| DialError::Engine(e.to_string()))?;
        let result = self
            .drive_signalling(&engine, addr, &sc, target, cancel)
            .await;
        if result.is_err() {
            engine.close().await;
        }
        result
    }

    async fn drive_signalling(
        &self,
        engine: &Arc<dyn PeerEngine>,
        addr: &Addr,
        sc: &Arc<SignallingChannel>,
        target: crate::addr::PeerId,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        let local = self.cfg.local_peer_id.clone();
        let mut events = engine.subscribe();
        let app = engine
            .create_channel(APP_CHANNEL_LABEL)
            .await
            .map_err(|e| DialError::Engine(e.to_string()))?;

        let offer = wait_local_offer(&mut events, cancel).await?;

        // Subscribe before sending the request so the response cannot
        // slip past; the subscription is dropped as soon as the awaited
        // response is delivered.
        let mut sc_rx = sc.subscribe();
        let request = SignallingMessage::ConnectRequest {
            src: local.clone(),
            dst: target.clone(),
            signal: offer,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            res = sc.send_message(&request) => res?,
        }

        let answer = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DialError::Aborted),
                ev = sc_rx.recv() => match ev {
                    Ok(ChannelEvent::Message(raw)) => match decode_message(&raw) {
                        Ok(SignallingMessage::ConnectResponse { src, dst, signal })
                            if src == target && dst == local =>
                        {
                            break signal;
                        }
                        // Everything else on the shared channel belongs to
                        // other consumers.
                        _ => continue,
                    },
                    Ok(ChannelEvent::Close) => return Err(ChannelError::Closed.into()),
                    Ok(ChannelEvent::Error(e)) if e == CHANNEL_CLOSED_MSG => {
                        return Err(ChannelError::Closed.into())
                    }
                    Ok(ChannelEvent::Error(e)) => return Err(ChannelError::Failed(e).into()),
                    Ok(ChannelEvent::Open) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ChannelError::Closed.into())
                    }
                },
            }
        };
        drop(sc_rx);

        engine
            .feed_signal(answer)
            .await
            .map_err(|e| DialError::Engine(e.to_string()))?;

        wait_ready(&mut events, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            res = all_open(vec![app.clone()]) => res?,
        }

        Ok(Connection {
            channel: app,
            remote: addr.clone(),
            opened_at: Instant::now(),
        })
    }

    // ------------------------------------------------------------------
    // Peer signalling channel supervision
    // ------------------------------------------------------------------

    /// Wire up a freshly opened peer signalling channel: join the relay,
    /// hand the channel to local listeners for incoming use, and start
    /// supervision.
    async fn adopt_peer_sc(
        &self,
        parent: Arc<dyn PeerEngine>,
        duct: Arc<dyn DataChannel>,
    ) -> Result<(), DialError> {
        let sc = SignallingChannel::new(ScRole::Peer, duct);
        self.spawn_supervisor(parent.clone(), sc.clone());

        sc.send_message(&SignallingMessage::JoinRequest {
            peer_id: self.cfg.local_peer_id.clone(),
        })
        .await?;
        sc.mark_joined();

        *self.slot.lock().expect("dialer slot poisoned") = Some(PeerScSlot {
            sc: sc.clone(),
            engine: parent,
        });
        self.registry.publish(sc.clone());
        debug!(sc = sc.id(), "peer signalling channel adopted");
        Ok(())
    }

    fn spawn_supervisor(&self, parent: Arc<dyn PeerEngine>, sc: Arc<SignallingChannel>) {
        let dialer = self.self_ref.clone();
        tokio::spawn(async move {
            let reclaimed = Arc::new(tokio::sync::Notify::new());
            let monitor = {
                let reclaimed = reclaimed.clone();
                ChannelMonitor::watch(sc.duct().clone(), move || reclaimed.notify_one())
            };

            let mut events = sc.subscribe();
            loop {
                tokio::select! {
                    _ = reclaimed.notified() => break,
                    ev = events.recv() => match ev {
                        Ok(ChannelEvent::Close) => break,
                        Ok(ChannelEvent::Error(e)) => {
                            if e != CHANNEL_CLOSED_MSG {
                                warn!(sc = sc.id(), error = %e, "peer signalling channel failed");
                            }
                            break;
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            monitor.stop();
            sc.mark_closed();

            let Some(dialer) = dialer.upgrade() else {
                return;
            };
            dialer.registry.retract(sc.id());
            {
                let mut slot = dialer.slot.lock().expect("dialer slot poisoned");
                if slot.as_ref().is_some_and(|s| s.sc.id() == sc.id()) {
                    *slot = None;
                }
            }

            if parent.is_closed() {
                debug!(sc = sc.id(), "parent connection gone, not reopening");
                return;
            }
            debug!(sc = sc.id(), "reopening peer signalling channel");
            match parent.create_channel(SIG_CHANNEL_LABEL).await {
                Ok(duct) => {
                    if all_open(vec![duct.clone()]).await.is_ok() {
                        if let Err(e) = dialer.adopt_peer_sc(parent, duct).await {
                            warn!(error = %e, "failed to re-adopt signalling channel");
                        }
                    }
                }
                Err(e) => debug!(error = %e, "signalling channel reopen failed"),
            }
        });
    }
}

// ----------------------------------------------------------------------
// Event helpers
// ----------------------------------------------------------------------

async fn wait_local_offer(
    events: &mut broadcast::Receiver<EngineEvent>,
    cancel: &CancellationToken,
) -> Result<Signal, DialError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            ev = events.recv() => match ev {
                Ok(EngineEvent::Signal(signal)) if signal.kind == SignalKind::Offer => {
                    return Ok(signal)
                }
                Ok(EngineEvent::Error(e)) => return Err(DialError::Engine(e)),
                Ok(EngineEvent::Closed) => return Err(DialError::Engine("engine closed".into())),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DialError::Engine("engine event stream closed".into()))
                }
            },
        }
    }
}

async fn wait_ready(
    events: &mut broadcast::Receiver<EngineEvent>,
    cancel: &CancellationToken,
) -> Result<(), DialError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Aborted),
            ev = events.recv() => match ev {
                Ok(EngineEvent::Ready) => return Ok(()),
                Ok(EngineEvent::Error(e)) => return Err(DialError::Engine(e)),
                Ok(EngineEvent::Closed) => return Err(DialError::Engine("engine closed".into())),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DialError::Engine("engine event stream closed".into()))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerId;
    use crate::memory::MemoryHub;
    use crate::transport::Config;

    fn peer_config(hub: &Arc<MemoryHub>, signalling: bool) -> Arc<Config> {
        Arc::new(Config {
            signalling_enabled: signalling,
            node_type: NodeType::Peer,
            local_peer_id: PeerId::new("QmSelf"),
            relay_peer_id: Some(PeerId::new("QmRelay")),
            engine: hub.factory(),
            initiator_options: Default::default(),
            receiver_options: Default::default(),
        })
    }

    fn dialer(cfg: Arc<Config>) -> Arc<Dialer> {
        Dialer::new(cfg, ScRegistry::new(), None)
    }

    #[tokio::test]
    async fn star_address_with_signalling_disabled_is_rejected() {
        let hub = MemoryHub::new();
        let dialer = dialer(peer_config(&hub, false));
        let addr: Addr =
            "/ip4/127.0.0.1/tcp/1/http/p2p-webrtc-direct/p2p/QmRelay/p2p-webrtc-star/p2p/QmB"
                .parse()
                .unwrap();

        let err = dialer.dial(&addr, DialOptions::default()).await.unwrap_err();
        assert!(matches!(err, DialError::RejectedAddress));
    }

    #[tokio::test]
    async fn star_dial_without_peer_channel_is_relay_unavailable() {
        let hub = MemoryHub::new();
        let dialer = dialer(peer_config(&hub, true));
        let addr: Addr =
            "/ip4/127.0.0.1/tcp/1/http/p2p-webrtc-direct/p2p/QmRelay/p2p-webrtc-star/p2p/QmB"
                .parse()
                .unwrap();

        let err = dialer.dial(&addr, DialOptions::default()).await.unwrap_err();
        assert!(matches!(err, DialError::RelayUnavailable));
    }

    #[tokio::test]
    async fn star_dial_without_destination_is_an_address_error() {
        let hub = MemoryHub::new();
        let dialer = dialer(peer_config(&hub, true));
        let addr: Addr = "/ip4/127.0.0.1/tcp/1/http/p2p-webrtc-direct/p2p/QmRelay/p2p-webrtc-star"
            .parse()
            .unwrap();

        let err = dialer.dial(&addr, DialOptions::default()).await.unwrap_err();
        assert!(matches!(err, DialError::Address(_)));
    }

    #[tokio::test]
    async fn pre_cancelled_dial_aborts_immediately() {
        let hub = MemoryHub::new();
        let dialer = dialer(peer_config(&hub, true));
        let addr: Addr = "/ip4/127.0.0.1/tcp/1/http/p2p-webrtc-direct".parse().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dialer
            .dial(&addr, DialOptions { cancel })
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Aborted));
    }

    #[tokio::test]
    async fn offline_http_dial_fails_without_connection() {
        let hub = MemoryHub::new();
        let dialer = dialer(peer_config(&hub, false));
        // Port 1 on loopback: nothing listens there.
        let addr: Addr = "/ip4/127.0.0.1/tcp/1/http/p2p-webrtc-direct".parse().unwrap();

        let err = dialer.dial(&addr, DialOptions::default()).await.unwrap_err();
        assert!(matches!(err, DialError::Http(_)));
        assert!(dialer.signalling_channel().is_none());
    }
}

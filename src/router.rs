//! Relay-side routing of signalling messages.
//!
//! Present on a listener running in relay role. The router tracks two
//! structures: `peer_table`, mapping a peer id to the signalling channel
//! it joined on, and `relay_list`, the channels to neighbouring relays.
//! Messages that cannot be delivered locally are flooded to every
//! neighbouring relay except the one they arrived on; deeper loops are
//! killed by the seen-cache.
//!
//! # Architecture
//!
//! The actor pattern keeps all table state in one task:
//! - [`RelayRouter`]: the public handle (cheap to clone, sends commands)
//! - `RouterActor`: owns the tables, processes commands sequentially
//! - One reader task per attached channel feeds inbound messages and
//!   close/error transitions back to the actor
//! - A [`ChannelMonitor`] per channel reclaims channels that closed
//!   without firing the close event

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::addr::PeerId;
use crate::channel::{ScRole, SignallingChannel};
use crate::codec::{decode_message, SignallingMessage};
use crate::engine::ChannelEvent;
use crate::monitor::{ChannelMonitor, CHANNEL_CLOSED_TIMEOUT};
use crate::seen::SeenCache;

const COMMAND_BUFFER: usize = 256;

/// Handle to the router actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayRouter {
    cmd_tx: mpsc::Sender<RouterCommand>,
}

/// Observable routing state, for tests and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct RouterSnapshot {
    /// Joined peers and the channel id each is reachable on.
    pub peers: Vec<(PeerId, u64)>,
    /// Channel ids of neighbouring relays.
    pub relays: Vec<u64>,
    /// Total channels attached (joined or not).
    pub attached: usize,
}

enum RouterCommand {
    Attach {
        sc: Arc<SignallingChannel>,
    },
    Inbound {
        sc_id: u64,
        raw: Vec<u8>,
    },
    Untrack {
        sc_id: u64,
    },
    Snapshot {
        reply: oneshot::Sender<RouterSnapshot>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Quit,
}

impl RelayRouter {
    /// Spawn the router actor with the default reclamation scan period.
    pub fn spawn() -> Self {
        Self::spawn_with_scan(CHANNEL_CLOSED_TIMEOUT)
    }

    pub fn spawn_with_scan(scan_period: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = RouterActor {
            cmd_tx: cmd_tx.clone(),
            scan_period,
            attached: HashMap::new(),
            peer_table: HashMap::new(),
            relay_list: Vec::new(),
            seen: SeenCache::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Register a signalling channel with the router. Relay channels join
    /// the relay list immediately; peer channels wait for a `JoinRequest`.
    pub async fn attach(&self, sc: Arc<SignallingChannel>) {
        let _ = self.cmd_tx.send(RouterCommand::Attach { sc }).await;
    }

    pub async fn snapshot(&self) -> RouterSnapshot {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RouterCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return RouterSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Drop every table entry and close every attached channel.
    pub async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(RouterCommand::Clear { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RouterCommand::Quit).await;
    }
}

struct AttachedSc {
    sc: Arc<SignallingChannel>,
    reader: JoinHandle<()>,
    monitor: ChannelMonitor,
}

struct RouterActor {
    cmd_tx: mpsc::Sender<RouterCommand>,
    scan_period: Duration,
    attached: HashMap<u64, AttachedSc>,
    peer_table: HashMap<PeerId, Arc<SignallingChannel>>,
    relay_list: Vec<Arc<SignallingChannel>>,
    seen: SeenCache,
}

impl RouterActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RouterCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RouterCommand::Attach { sc } => self.attach(sc),
                RouterCommand::Inbound { sc_id, raw } => self.inbound(sc_id, raw).await,
                RouterCommand::Untrack { sc_id } => self.untrack(sc_id),
                RouterCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                RouterCommand::Clear { reply } => {
                    self.clear().await;
                    let _ = reply.send(());
                }
                RouterCommand::Quit => break,
            }
        }
        debug!("relay router shutting down");
        self.clear().await;
    }

    fn attach(&mut self, sc: Arc<SignallingChannel>) {
        let sc_id = sc.id();
        if self.attached.contains_key(&sc_id) {
            return;
        }

        let reader = {
            let cmd_tx = self.cmd_tx.clone();
            let mut events = sc.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ChannelEvent::Message(raw)) => {
                            if cmd_tx
                                .send(RouterCommand::Inbound { sc_id, raw })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(ChannelEvent::Open) => continue,
                        Ok(ChannelEvent::Close) => {
                            let _ = cmd_tx.send(RouterCommand::Untrack { sc_id }).await;
                            return;
                        }
                        Ok(ChannelEvent::Error(e)) => {
                            warn!(sc = sc_id, error = %e, "signalling channel error");
                            let _ = cmd_tx.send(RouterCommand::Untrack { sc_id }).await;
                            return;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(sc = sc_id, dropped = n, "router reader lagging");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = cmd_tx.send(RouterCommand::Untrack { sc_id }).await;
                            return;
                        }
                    }
                }
            })
        };

        // Event close and periodic reclamation both funnel into Untrack,
        // which is idempotent.
        let monitor = {
            let cmd_tx = self.cmd_tx.clone();
            ChannelMonitor::watch_every(self.scan_period, sc.duct().clone(), move || {
                let _ = cmd_tx.try_send(RouterCommand::Untrack { sc_id });
            })
        };

        if sc.role() == ScRole::Relay {
            sc.mark_relayed();
            if !self.relay_list.iter().any(|r| r.id() == sc_id) {
                self.relay_list.push(sc.clone());
            }
            debug!(sc = sc_id, "relay channel attached");
        } else {
            debug!(sc = sc_id, "peer channel attached, awaiting join");
        }

        self.attached.insert(
            sc_id,
            AttachedSc {
                sc,
                reader,
                monitor,
            },
        );
    }

    async fn inbound(&mut self, sc_id: u64, raw: Vec<u8>) {
        let msg = match decode_message(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(sc = sc_id, error = %e, "dropping undecodable signalling message");
                return;
            }
        };

        match msg {
            SignallingMessage::JoinRequest { peer_id } => self.join(sc_id, peer_id),
            other => {
                let dst = other.dst().cloned();
                match dst {
                    Some(dst) => self.forward(sc_id, &dst, raw).await,
                    None => trace!(sc = sc_id, "ignoring unroutable message"),
                }
            }
        }
    }

    fn join(&mut self, sc_id: u64, peer_id: PeerId) {
        let Some(entry) = self.attached.get(&sc_id) else {
            return;
        };
        if entry.sc.role() == ScRole::Relay {
            warn!(sc = sc_id, peer = %peer_id, "join request on a relay channel, dropping");
            return;
        }
        entry.sc.mark_joined();
        let replaced = self.peer_table.insert(peer_id.clone(), entry.sc.clone());
        match replaced {
            Some(old) if old.id() != sc_id => {
                debug!(peer = %peer_id, old_sc = old.id(), new_sc = sc_id, "peer re-registered")
            }
            _ => debug!(peer = %peer_id, sc = sc_id, "peer joined"),
        }
    }

    /// Forward a routed message: deliver to the joined peer if known,
    /// otherwise flood to every neighbouring relay except the arrival
    /// channel. A broken neighbour never blocks the traversal.
    async fn forward(&mut self, from: u64, dst: &PeerId, raw: Vec<u8>) {
        if self.seen.observe(&raw) {
            trace!(sc = from, dst = %dst, "suppressing already-seen message");
            return;
        }

        if let Some(sc) = self.peer_table.get(dst) {
            trace!(dst = %dst, sc = sc.id(), "delivering to joined peer");
            match sc.send_raw(raw).await {
                Ok(()) => {}
                // A close racing a pending send is ordinary churn.
                Err(crate::channel::ChannelError::Closed) => {
                    debug!(dst = %dst, sc = sc.id(), "channel closed under a pending delivery")
                }
                Err(e) => warn!(dst = %dst, sc = sc.id(), error = %e, "delivery to peer failed"),
            }
            return;
        }

        let targets: Vec<_> = self
            .relay_list
            .iter()
            .filter(|rsc| rsc.id() != from)
            .cloned()
            .collect();
        trace!(dst = %dst, fanout = targets.len(), "flooding to neighbouring relays");
        for rsc in targets {
            if let Err(e) = rsc.send_raw(raw.clone()).await {
                warn!(sc = rsc.id(), error = %e, "flood send failed");
            }
        }
    }

    fn untrack(&mut self, sc_id: u64) {
        let Some(entry) = self.attached.remove(&sc_id) else {
            return;
        };
        entry.reader.abort();
        entry.monitor.stop();
        entry.sc.mark_closed();
        self.peer_table.retain(|_, sc| sc.id() != sc_id);
        self.relay_list.retain(|sc| sc.id() != sc_id);
        debug!(sc = sc_id, "untracked signalling channel");
    }

    async fn clear(&mut self) {
        self.peer_table.clear();
        self.relay_list.clear();
        for (_, entry) in self.attached.drain() {
            entry.reader.abort();
            entry.monitor.stop();
            entry.sc.close().await;
        }
    }

    fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            peers: self
                .peer_table
                .iter()
                .map(|(pid, sc)| (pid.clone(), sc.id()))
                .collect(),
            relays: self.relay_list.iter().map(|sc| sc.id()).collect(),
            attached: self.attached.len(),
        }
    }
}

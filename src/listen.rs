//! Inbound connection establishment.
//!
//! A listener is one of two variants, chosen at construction:
//!
//! - **HTTP listener**: runs the bootstrap HTTP server: each request
//!   carries a base58-wrapped offer, the listener drives a receiver
//!   engine and returns the answer in the response body. It also accepts
//!   signalling channels registered by the dial engine: on a relay they
//!   feed the router, on a peer they serve relayed inbound offers.
//! - **Signalling listener**: no HTTP server; selected when signalling
//!   is enabled and the listen address carries the star marker. Inbound
//!   offers arrive as `ConnectRequest`s on the peer signalling channel
//!   registered by the dial engine, and answers travel back as
//!   `ConnectResponse`s on the same channel.
//!
//! Both variants emit `{listening, connection, close}` events and track
//! the connections and channels they produced; tracked entries are pruned
//! as soon as the underlying channel dies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::addr::{Addr, PeerId};
use crate::channel::{all_open, Connection, ScRole, SignallingChannel};
use crate::codec::{
    decode_message, decode_signal, encode_signal, from_base58, to_base58, ScKind, Signal,
    SignalKind, SignallingMessage,
};
use crate::engine::{
    ChannelEvent, DataChannel, EngineEvent, PeerEngine, CHANNEL_CLOSED_MSG, SIG_CHANNEL_LABEL,
};
use crate::monitor::ChannelMonitor;
use crate::router::RelayRouter;
use crate::transport::Config;

/// Bound on waiting for the HTTP server to drain during close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll period for pruning tracked connections whose channel died.
const PRUNE_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("unusable listen address: {0}")]
    Address(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum ListenerEvent {
    Listening(Addr),
    Connection(Connection),
    Closed,
}

/// Dependencies a listener needs from the transport facade.
#[derive(Clone)]
pub struct ListenCtx {
    pub cfg: Arc<Config>,
    pub router: Option<RelayRouter>,
    pub registry: Arc<crate::channel::ScRegistry>,
}

/// A listener is total on its interface in either variant.
pub enum Listener {
    Http(HttpListener),
    Sig(SigListener),
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Listener::Http(_) => f.write_str("Listener::Http(..)"),
            Listener::Sig(_) => f.write_str("Listener::Sig(..)"),
        }
    }
}

impl Listener {
    pub async fn bind(addr: &Addr, ctx: ListenCtx) -> Result<Listener, ListenError> {
        if ctx.cfg.signalling_enabled && addr.star {
            Ok(Listener::Sig(SigListener::bind(addr, ctx).await?))
        } else {
            Ok(Listener::Http(HttpListener::bind(addr, ctx).await?))
        }
    }

    /// Take the event receiver. Yields `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ListenerEvent>> {
        match self {
            Listener::Http(l) => l.events.lock().await.take(),
            Listener::Sig(l) => l.events.lock().await.take(),
        }
    }

    pub fn addrs(&self) -> Vec<Addr> {
        match self {
            Listener::Http(l) => vec![l.local.clone()],
            Listener::Sig(l) => l.addrs(),
        }
    }

    pub async fn close(&self) {
        match self {
            Listener::Http(l) => l.close().await,
            Listener::Sig(l) => l.close().await,
        }
    }

    /// Tracked (connections, channels) counts.
    pub fn tracked(&self) -> (usize, usize) {
        let tracker = match self {
            Listener::Http(l) => &l.shared.tracker,
            Listener::Sig(l) => &l.tracker,
        };
        tracker.counts()
    }
}

type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Shared inbound bookkeeping
// ============================================================================

/// Connection/channel tracking shared by both listener variants.
struct InboundTracker {
    cfg: Arc<Config>,
    events_tx: mpsc::Sender<ListenerEvent>,
    conns: Mutex<Vec<Connection>>,
    channels: Mutex<Vec<Arc<dyn DataChannel>>>,
    monitors: Mutex<Vec<ChannelMonitor>>,
}

impl InboundTracker {
    fn new(cfg: Arc<Config>, events_tx: mpsc::Sender<ListenerEvent>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            events_tx,
            conns: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
        })
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.conns.lock().expect("tracker poisoned").len(),
            self.channels.lock().expect("tracker poisoned").len(),
        )
    }

    /// Track a connection and prune it the moment its channel dies.
    fn track_connection(self: &Arc<Self>, conn: Connection) {
        self.conns
            .lock()
            .expect("tracker poisoned")
            .push(conn.clone());
        self.track_channel(conn.channel.clone());
    }

    fn track_channel(self: &Arc<Self>, ch: Arc<dyn DataChannel>) {
        self.channels
            .lock()
            .expect("tracker poisoned")
            .push(ch.clone());

        let tracker = self.clone();
        let watched = ch.clone();
        let monitor = ChannelMonitor::watch_every(PRUNE_INTERVAL, ch, move || {
            tracker.prune(&watched);
        });
        self.monitors.lock().expect("tracker poisoned").push(monitor);
    }

    fn prune(&self, ch: &Arc<dyn DataChannel>) {
        self.conns
            .lock()
            .expect("tracker poisoned")
            .retain(|c| !Arc::ptr_eq(&c.channel, ch));
        self.channels
            .lock()
            .expect("tracker poisoned")
            .retain(|c| !Arc::ptr_eq(c, ch));
        trace!(label = ch.label(), "pruned dead channel");
    }

    async fn close_all(&self) {
        let conns: Vec<_> = self
            .conns
            .lock()
            .expect("tracker poisoned")
            .drain(..)
            .collect();
        for conn in conns {
            conn.channel.close().await;
        }
        let channels: Vec<_> = self
            .channels
            .lock()
            .expect("tracker poisoned")
            .drain(..)
            .collect();
        for ch in channels {
            ch.close().await;
        }
        for monitor in self.monitors.lock().expect("tracker poisoned").drain(..) {
            monitor.stop();
        }
    }

    async fn emit(&self, event: ListenerEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

// ============================================================================
// HTTP listener
// ============================================================================

struct HttpShared {
    tracker: Arc<InboundTracker>,
    router: Option<RelayRouter>,
    local: Addr,
}

pub struct HttpListener {
    shared: Arc<HttpShared>,
    events: TakeOnce<ListenerEvent>,
    local: Addr,
    shutdown: Arc<tokio::sync::Notify>,
    server: Mutex<Option<JoinHandle<()>>>,
    registry_task: JoinHandle<()>,
    serve_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HttpListener {
    pub async fn bind(addr: &Addr, ctx: ListenCtx) -> Result<Self, ListenError> {
        let tcp = tokio::net::TcpListener::bind(addr.socket_addr()).await?;
        let bound = tcp.local_addr()?;
        let mut local = addr.clone();
        local.port = bound.port();

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let tracker = InboundTracker::new(ctx.cfg.clone(), events_tx);
        let shared = Arc::new(HttpShared {
            tracker: tracker.clone(),
            router: ctx.router.clone(),
            local: local.clone(),
        });

        let app = Router::new()
            .route("/", any(handle_signal))
            .with_state(shared.clone());
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let serve = axum::serve(
                    tcp,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.notified().await });
                if let Err(e) = serve.await {
                    warn!(error = %e, "http listener terminated");
                }
            })
        };

        // Signalling channels registered by the dial engine: a relay
        // routes them, a peer serves relayed inbound offers on them.
        let serve_tasks = Arc::new(Mutex::new(Vec::new()));
        let registry_task = {
            let shared = shared.clone();
            let serve_tasks = serve_tasks.clone();
            let mut sink = ctx.registry.attach_sink();
            tokio::spawn(async move {
                while let Some(sc) = sink.recv().await {
                    match &shared.router {
                        Some(router) => router.attach(sc).await,
                        None => {
                            let tracker = shared.tracker.clone();
                            let base = shared.local.clone();
                            let task = tokio::spawn(serve_connect_requests(
                                tracker,
                                sc,
                                base,
                                || {},
                            ));
                            serve_tasks.lock().expect("serve tasks poisoned").push(task);
                        }
                    }
                }
            })
        };

        info!(addr = %local, "http listener up");
        tracker.emit(ListenerEvent::Listening(local.clone())).await;

        Ok(Self {
            shared,
            events: tokio::sync::Mutex::new(Some(events_rx)),
            local,
            shutdown,
            server: Mutex::new(Some(server)),
            registry_task,
            serve_tasks,
        })
    }

    pub fn local_addr(&self) -> &Addr {
        &self.local
    }

    pub async fn close(&self) {
        self.shared.tracker.close_all().await;
        if let Some(router) = &self.shared.router {
            router.clear().await;
        }

        self.shutdown.notify_one();
        let server = self.server.lock().expect("server slot poisoned").take();
        if let Some(mut handle) = server {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                warn!("http server did not drain in time, tearing down");
                handle.abort();
            }
        }

        self.registry_task.abort();
        for task in self
            .serve_tasks
            .lock()
            .expect("serve tasks poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.shared.tracker.emit(ListenerEvent::Closed).await;
        debug!(addr = %self.local, "http listener closed");
    }
}

fn reply(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

async fn handle_signal(
    State(shared): State<Arc<HttpShared>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match process_offer(&shared, remote, &params).await {
        Ok(Some(body)) => reply(StatusCode::OK, body),
        Ok(None) => reply(StatusCode::OK, String::new()),
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting signalling request");
            reply(StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Steps 1–4 of the inbound flow: validate the request, decode the offer,
/// drive a receiver engine to its answer, and hand the rest of the
/// establishment to a background task. Returns the base58 response body,
/// or `None` for a well-formed non-offer envelope.
async fn process_offer(
    shared: &Arc<HttpShared>,
    remote: SocketAddr,
    params: &HashMap<String, String>,
) -> anyhow::Result<Option<String>> {
    let signal_param = params.get("signal").context("missing signal parameter")?;
    let sc_kind = match params.get("signalling_channel") {
        None => ScKind::None,
        Some(raw) => ScKind::parse(raw)
            .with_context(|| format!("invalid signalling_channel tag {raw:?}"))?,
    };

    let signal = decode_signal(&from_base58(signal_param)?)?;
    if signal.kind != SignalKind::Offer {
        trace!(remote = %remote, kind = ?signal.kind, "non-offer envelope, empty response");
        return Ok(None);
    }

    let cfg = &shared.tracker.cfg;
    let engine = cfg.engine.receiver(&cfg.receiver_options).await?;
    let mut events = engine.subscribe();
    if let Err(e) = engine.feed_signal(signal).await {
        engine.close().await;
        return Err(e);
    }

    let answer = match wait_local_signal(&mut events).await {
        Ok(answer) => answer,
        Err(e) => {
            engine.close().await;
            return Err(e);
        }
    };

    tokio::spawn(complete_inbound(
        shared.clone(),
        engine,
        events,
        remote,
        sc_kind,
    ));

    Ok(Some(to_base58(&encode_signal(&answer)?)))
}

/// Steps 5–6: wait until the engine is ready, the application channel is
/// open, and the deferred signalling-channel readiness has resolved (it
/// resolves immediately when none was requested); then track and emit the
/// connection. Afterwards the task keeps watching the engine so
/// signalling channels reopened on this connection are wired in too.
async fn complete_inbound(
    shared: Arc<HttpShared>,
    engine: Arc<dyn PeerEngine>,
    mut events: broadcast::Receiver<EngineEvent>,
    remote: SocketAddr,
    kind: ScKind,
) {
    let mut ready = false;
    let mut app: Option<Arc<dyn DataChannel>> = None;
    let mut sig_ready = kind == ScKind::None;

    while !(ready && app.is_some() && sig_ready) {
        match events.recv().await {
            Ok(EngineEvent::Ready) => ready = true,
            Ok(EngineEvent::Channel(ch)) => {
                if ch.label() == SIG_CHANNEL_LABEL {
                    if kind != ScKind::None && !sig_ready {
                        wire_signalling_channel(&shared, kind, ch.clone()).await;
                        if all_open(vec![ch]).await.is_err() {
                            engine.close().await;
                            return;
                        }
                        sig_ready = true;
                    }
                } else if app.is_none() {
                    app = Some(ch);
                }
            }
            Ok(EngineEvent::Error(e)) => {
                warn!(remote = %remote, error = %e, "inbound establishment failed");
                engine.close().await;
                return;
            }
            Ok(EngineEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }

    let app = app.expect("application channel present");
    if all_open(vec![app.clone()]).await.is_err() {
        engine.close().await;
        return;
    }

    let conn = Connection {
        channel: app,
        remote: Addr::from_socket(remote),
        opened_at: Instant::now(),
    };
    debug!(remote = %conn.remote, "inbound connection established");
    shared.tracker.track_connection(conn.clone());
    shared.tracker.emit(ListenerEvent::Connection(conn)).await;

    if kind == ScKind::None {
        return;
    }

    // Steady state: signalling channels reopened on this connection are
    // wired in until the engine goes away.
    loop {
        match events.recv().await {
            Ok(EngineEvent::Channel(ch)) if ch.label() == SIG_CHANNEL_LABEL => {
                wire_signalling_channel(&shared, kind, ch).await;
            }
            Ok(EngineEvent::Error(_)) | Ok(EngineEvent::Closed) => return,
            Err(broadcast::error::RecvError::Closed) => return,
            _ => continue,
        }
    }
}

/// Classify and wire a signalling channel announced by the remote:
/// `relay` joins the relay list, `peer` is routed (on a relay) or served
/// (on a peer). The routing consumer subscribes before anything awaits
/// the channel's openness, so no message is lost to the replay.
async fn wire_signalling_channel(shared: &Arc<HttpShared>, kind: ScKind, duct: Arc<dyn DataChannel>) {
    shared.tracker.track_channel(duct.clone());
    match kind {
        ScKind::Relay => {
            let sc = SignallingChannel::new(ScRole::Relay, duct);
            match &shared.router {
                Some(router) => router.attach(sc).await,
                None => warn!("relay signalling channel on a node without a router"),
            }
        }
        ScKind::Peer => {
            let sc = SignallingChannel::new(ScRole::Peer, duct);
            match &shared.router {
                Some(router) => router.attach(sc).await,
                None => {
                    let tracker = shared.tracker.clone();
                    let base = shared.local.clone();
                    tokio::spawn(serve_connect_requests(tracker, sc, base, || {}));
                }
            }
        }
        ScKind::None => {}
    }
}

// ============================================================================
// Signalling listener
// ============================================================================

pub struct SigListener {
    tracker: Arc<InboundTracker>,
    events: TakeOnce<ListenerEvent>,
    configured: Addr,
    addr: Arc<Mutex<Option<Addr>>>,
    active: Arc<AtomicBool>,
    registry_task: JoinHandle<()>,
    serve_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SigListener {
    pub async fn bind(addr: &Addr, ctx: ListenCtx) -> Result<Self, ListenError> {
        if !addr.star {
            return Err(ListenError::Address(
                "signalling listener requires the star marker".into(),
            ));
        }
        if addr.owner.as_ref() != ctx.cfg.relay_peer_id.as_ref() {
            return Err(ListenError::Address(
                "listen address must embed the primary relay peer id".into(),
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let tracker = InboundTracker::new(ctx.cfg.clone(), events_tx);
        let slot = Arc::new(Mutex::new(Some(addr.clone())));
        let active = Arc::new(AtomicBool::new(true));
        let serve_tasks = Arc::new(Mutex::new(Vec::new()));

        let registry_task = {
            let tracker = tracker.clone();
            let slot = slot.clone();
            let active = active.clone();
            let serve_tasks = serve_tasks.clone();
            let configured = addr.clone();
            let mut sink = ctx.registry.attach_sink();
            tokio::spawn(async move {
                while let Some(sc) = sink.recv().await {
                    // A re-registered channel reactivates an inactive
                    // listener; re-announce happens upstream.
                    if !active.swap(true, Ordering::SeqCst) {
                        *slot.lock().expect("addr slot poisoned") = Some(configured.clone());
                        debug!(addr = %configured, "signalling listener reactivated");
                    }
                    let on_close = {
                        let slot = slot.clone();
                        let active = active.clone();
                        let tracker = tracker.clone();
                        move || {
                            active.store(false, Ordering::SeqCst);
                            *slot.lock().expect("addr slot poisoned") = None;
                            let tracker = tracker.clone();
                            tokio::spawn(async move {
                                tracker.emit(ListenerEvent::Closed).await;
                            });
                        }
                    };
                    let task = tokio::spawn(serve_connect_requests(
                        tracker.clone(),
                        sc,
                        configured.clone(),
                        on_close,
                    ));
                    serve_tasks.lock().expect("serve tasks poisoned").push(task);
                }
            })
        };

        info!(addr = %addr, "signalling listener up");
        let listener = Self {
            tracker,
            events: tokio::sync::Mutex::new(Some(events_rx)),
            configured: addr.clone(),
            addr: slot,
            active,
            registry_task,
            serve_tasks,
        };
        listener
            .tracker
            .emit(ListenerEvent::Listening(addr.clone()))
            .await;
        Ok(listener)
    }

    /// Empty once the signalling channel died: the surrounding system
    /// re-announces when a channel is registered again.
    pub fn addrs(&self) -> Vec<Addr> {
        self.addr
            .lock()
            .expect("addr slot poisoned")
            .clone()
            .into_iter()
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn configured_addr(&self) -> &Addr {
        &self.configured
    }

    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        *self.addr.lock().expect("addr slot poisoned") = None;
        self.tracker.close_all().await;
        self.registry_task.abort();
        for task in self
            .serve_tasks
            .lock()
            .expect("serve tasks poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.tracker.emit(ListenerEvent::Closed).await;
        debug!(addr = %self.configured, "signalling listener closed");
    }
}

// ============================================================================
// Relayed inbound offers
// ============================================================================

/// Read a signalling channel, answering each inbound `ConnectRequest`
/// with a receiver-engine answer. Non-`ConnectRequest` messages are
/// ignored; channel death invokes `on_close` once.
async fn serve_connect_requests<F>(
    tracker: Arc<InboundTracker>,
    sc: Arc<SignallingChannel>,
    base_addr: Addr,
    on_close: F,
) where
    F: FnOnce() + Send + 'static,
{
    let mut rx = sc.subscribe();
    loop {
        match rx.recv().await {
            Ok(ChannelEvent::Message(raw)) => match decode_message(&raw) {
                Ok(SignallingMessage::ConnectRequest { src, dst, signal }) => {
                    let tracker = tracker.clone();
                    let sc = sc.clone();
                    let base = base_addr.clone();
                    tokio::spawn(async move {
                        answer_connect_request(tracker, sc, base, src, dst, signal).await;
                    });
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(sc = sc.id(), error = %e, "dropping undecodable message");
                    continue;
                }
            },
            Ok(ChannelEvent::Close) => break,
            Ok(ChannelEvent::Error(e)) => {
                if e != CHANNEL_CLOSED_MSG {
                    warn!(sc = sc.id(), error = %e, "signalling channel failed");
                }
                break;
            }
            Ok(ChannelEvent::Open) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(sc = sc.id(), dropped = n, "listener lagging on signalling channel");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(sc = sc.id(), "signalling channel handler removed");
    on_close();
}

/// Drive a receiver engine for one relayed offer and send the answer
/// back on the same channel. The connection's remote address is the
/// listening address plus the request's `dst`.
async fn answer_connect_request(
    tracker: Arc<InboundTracker>,
    sc: Arc<SignallingChannel>,
    base_addr: Addr,
    src: PeerId,
    dst: PeerId,
    signal: Signal,
) {
    if signal.kind != SignalKind::Offer {
        trace!(src = %src, kind = ?signal.kind, "ignoring non-offer connect request");
        return;
    }

    let cfg = &tracker.cfg;
    let engine = match cfg.engine.receiver(&cfg.receiver_options).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!(error = %e, "receiver engine creation failed");
            return;
        }
    };
    let mut events = engine.subscribe();
    if let Err(e) = engine.feed_signal(signal).await {
        warn!(src = %src, error = %e, "bad relayed offer");
        engine.close().await;
        return;
    }

    let answer = match wait_local_signal(&mut events).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(src = %src, error = %e, "no answer produced");
            engine.close().await;
            return;
        }
    };

    let response = SignallingMessage::ConnectResponse {
        src: dst.clone(),
        dst: src.clone(),
        signal: answer,
    };
    if let Err(e) = sc.send_message(&response).await {
        warn!(dst = %src, error = %e, "failed to send connect response");
        engine.close().await;
        return;
    }

    // Completion: engine ready plus the application channel. No
    // signalling channel is requested on this path.
    let mut ready = false;
    let mut app: Option<Arc<dyn DataChannel>> = None;
    while !(ready && app.is_some()) {
        match events.recv().await {
            Ok(EngineEvent::Ready) => ready = true,
            Ok(EngineEvent::Channel(ch)) if ch.label() != SIG_CHANNEL_LABEL => {
                if app.is_none() {
                    app = Some(ch);
                }
            }
            Ok(EngineEvent::Error(e)) => {
                warn!(src = %src, error = %e, "relayed establishment failed");
                engine.close().await;
                return;
            }
            Ok(EngineEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }

    let app = app.expect("application channel present");
    if all_open(vec![app.clone()]).await.is_err() {
        engine.close().await;
        return;
    }

    let conn = Connection {
        channel: app,
        remote: base_addr.with_destination(dst),
        opened_at: Instant::now(),
    };
    debug!(remote = %conn.remote, "relayed inbound connection established");
    tracker.track_connection(conn.clone());
    tracker.emit(ListenerEvent::Connection(conn)).await;
}

async fn wait_local_signal(
    events: &mut broadcast::Receiver<EngineEvent>,
) -> anyhow::Result<Signal> {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Signal(signal)) => return Ok(signal),
            Ok(EngineEvent::Error(e)) => anyhow::bail!("engine failed: {e}"),
            Ok(EngineEvent::Closed) => anyhow::bail!("engine closed"),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("engine event stream closed")
            }
        }
    }
}

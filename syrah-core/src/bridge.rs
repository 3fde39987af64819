//! WebSocket control bridge.
//!
//! Clients attach to `ws://<host>:<port>/`, receive every flow event and
//! send commands back. The bridge owns the shared state the engine hooks and
//! the connection handlers meet on: the rule store, the held-flow registry
//! and the peer set.

use crate::broadcaster::{run_fanout, EventBroadcaster, PeerRegistry};
use crate::config::BridgeConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::BridgeError;
use crate::interceptor::Interceptor;
use crate::registry::InterceptionRegistry;
use crate::rules::RuleStore;
use crate::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one control connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Move to `next` if it is later than the current state. Returns false
    /// when the transition was a no-op, so teardown can run from either the
    /// reader or the writer without happening twice.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    rules: Arc<RuleStore>,
    registry: InterceptionRegistry,
    peers: PeerRegistry,
    events: EventBroadcaster,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let peers = PeerRegistry::new();
        Self {
            rules: Arc::new(RuleStore::new()),
            registry: InterceptionRegistry::new(),
            events: EventBroadcaster::new(peers.clone(), tx),
            peers,
            event_rx: Arc::new(Mutex::new(Some(rx))),
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Hooks for the interception engine, wired to this bridge's state.
    pub fn interceptor(&self) -> Interceptor {
        Interceptor::new(
            self.rules.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.map_local_timeout(),
        )
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.rules.clone(), self.registry.clone())
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn registry(&self) -> &InterceptionRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Bind the listener and start serving. Fails when the configuration is
    /// unusable, the socket cannot be bound or the bridge is already running.
    pub async fn start(&self) -> Result<BridgeHandle> {
        self.config.validate()?;
        let mut slot = self.event_rx.lock().await;
        if slot.is_none() {
            return Err(BridgeError::Server("bridge is already running".to_string()));
        }

        let addr = self.config.socket_addr();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let Some(events) = slot.take() else {
            return Err(BridgeError::Server("bridge is already running".to_string()));
        };
        drop(slot);

        let token = CancellationToken::new();
        let context = ConnectionContext {
            dispatcher: self.dispatcher(),
            peers: self.peers.clone(),
            peer_queue_capacity: self.config.peer_queue_capacity,
            shutdown: token.clone(),
        };
        let app = Router::new().route("/", get(ws_handler)).with_state(context);

        let fanout = tokio::spawn(run_fanout(events, self.peers.clone(), token.clone()));

        let shutdown = token.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("Bridge server failed: {}", e);
            }
        });

        info!("Syrah Bridge WebSocket server started on ws://{}", local_addr);
        Ok(BridgeHandle {
            local_addr,
            token,
            server,
            fanout,
            event_slot: self.event_rx.clone(),
            peers: self.peers.clone(),
        })
    }
}

/// Running bridge. Dropping the handle leaves the bridge running; call
/// [`BridgeHandle::stop`] to shut it down.
pub struct BridgeHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    server: JoinHandle<()>,
    fanout: JoinHandle<mpsc::Receiver<String>>,
    event_slot: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
    peers: PeerRegistry,
}

impl BridgeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every connection and stop accepting new ones. The bridge can be
    /// started again afterwards.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.server.await {
            error!("Bridge server task panicked: {}", e);
        }
        match self.fanout.await {
            Ok(events) => *self.event_slot.lock().await = Some(events),
            Err(e) => error!("Event fan-out task panicked: {}", e),
        }
        self.peers.clear();
        info!("Syrah Bridge stopped");
    }
}

#[derive(Clone)]
struct ConnectionContext {
    dispatcher: CommandDispatcher,
    peers: PeerRegistry,
    peer_queue_capacity: usize,
    shutdown: CancellationToken,
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<ConnectionContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

async fn handle_connection(socket: WebSocket, ctx: ConnectionContext) {
    let id = Uuid::new_v4();
    let mut state = ConnectionState::Connecting;
    let (tx, mut outbound) = mpsc::channel(ctx.peer_queue_capacity);
    ctx.peers.insert(id, tx);
    state.advance(ConnectionState::Open);
    info!("Client connected. Total clients: {}", ctx.peers.len());

    let (mut sink, mut stream) = socket.split();
    tokio::select! {
        _ = write_loop(&mut sink, &mut outbound) => debug!("Client {} writer finished", id),
        _ = read_loop(&mut stream, &ctx, id) => debug!("Client {} reader finished", id),
        _ = ctx.shutdown.cancelled() => debug!("Client {} closed by shutdown", id),
    }

    if state.advance(ConnectionState::Closing) {
        let _ = sink.send(Message::Close(None)).await;
    }
    ctx.peers.remove(&id);
    state.advance(ConnectionState::Closed);
    info!("Client disconnected. Total clients: {}", ctx.peers.len());
}

/// Drain the peer queue into the socket. Ends when the queue is closed,
/// which is how the broadcaster evicts a slow peer.
async fn write_loop(sink: &mut SplitSink<WebSocket, Message>, outbound: &mut mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!("Send failed: {}", e);
            break;
        }
    }
}

async fn read_loop(stream: &mut SplitStream<WebSocket>, ctx: &ConnectionContext, id: Uuid) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Ignoring non UTF-8 binary frame from client {}", id);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Client {} read error: {}", id, e);
                break;
            }
        };

        let Some(reply) = ctx.dispatcher.dispatch(&text) else {
            continue;
        };
        match reply.encode() {
            Ok(encoded) => {
                ctx.peers.send_to(&id, encoded);
            }
            Err(e) => error!("Failed to encode reply: {}", e),
        }
    }
}

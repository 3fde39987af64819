//! Engine -> client event delivery.
//!
//! The engine side encodes an event and pushes the text into a bounded
//! queue without blocking. A fan-out task on the bridge side copies each
//! message into every peer's own bounded queue; a peer that cannot take it
//! is dropped instead of retried.

use crate::codec::{encode_flow_event, EventPhase};
use crate::flow::Flow;
use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Live control-channel peers: connection id -> outbound queue.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<Uuid, mpsc::Sender<Message>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, id: Uuid, tx: mpsc::Sender<Message>) {
        self.peers.insert(id, tx);
    }

    /// Remove a peer. Returns false if it was already gone.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Queue a message for one peer. A peer that cannot accept it is removed.
    pub fn send_to(&self, id: &Uuid, text: String) -> bool {
        let result = match self.peers.get(id) {
            Some(tx) => tx.try_send(Message::Text(text)),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping client {}: {}", id, describe(&e));
                self.remove(id);
                false
            }
        }
    }

    /// Queue the same message for every peer. Returns how many accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;
        for entry in self.peers.iter() {
            match entry.value().try_send(Message::Text(text.to_string())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Dropping client {}: {}", entry.key(), describe(&e));
                    failed.push(*entry.key());
                }
            }
        }
        // removal happens outside the iteration, which holds shard read locks
        for id in failed {
            self.remove(&id);
        }
        delivered
    }
}

fn describe<T>(err: &TrySendError<T>) -> &'static str {
    match err {
        TrySendError::Full(_) => "outbound queue full",
        TrySendError::Closed(_) => "connection closed",
    }
}

/// Engine-facing handle that publishes flow events.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    peers: PeerRegistry,
    queue: mpsc::Sender<String>,
}

impl EventBroadcaster {
    pub fn new(peers: PeerRegistry, queue: mpsc::Sender<String>) -> Self {
        Self { peers, queue }
    }

    /// Encode and enqueue an event. Never blocks; drops the event when no
    /// peer is connected or the queue is full.
    pub fn publish(&self, flow: &Flow, phase: EventPhase) {
        if self.peers.is_empty() {
            return;
        }
        let message = match encode_flow_event(flow, phase) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode flow {}: {}", flow.id, e);
                return;
            }
        };
        match self.queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event queue full, dropping {:?} event for flow {}", phase, flow.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Bridge not running, dropping event for flow {}", flow.id);
            }
        }
    }
}

/// Bridge-side loop draining the event queue into every peer.
pub async fn run_fanout(
    mut events: mpsc::Receiver<String>,
    peers: PeerRegistry,
    shutdown: CancellationToken,
) -> mpsc::Receiver<String> {
    info!("Event fan-out started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.recv() => match next {
                Some(message) => {
                    let delivered = peers.broadcast(&message);
                    debug!("Event delivered to {} client(s)", delivered);
                }
                None => break,
            },
        }
    }
    info!("Event fan-out stopped");
    events
}

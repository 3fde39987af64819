use crate::codec::FlowModifications;
use crate::error::RegistryError;
use crate::rules::Phase;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Decision a client makes about a held flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue forwarding, after applying the edits if any
    Resume(Option<FlowModifications>),
    /// Terminate the flow
    Kill,
}

/// Registry entry for a flow paused by a breakpoint.
///
/// The handle is the sending half of the verdict channel; the receiving half
/// lives in the engine task that owns the flow, so the verdict is applied
/// there and never on the connection side.
#[derive(Debug)]
pub struct HeldFlow {
    pub phase: Phase,
    pub held_at: DateTime<Utc>,
    verdict_tx: oneshot::Sender<Verdict>,
}

impl HeldFlow {
    /// Time since the flow was paused.
    pub fn held_for(&self) -> chrono::Duration {
        Utc::now() - self.held_at
    }

    /// Hand the verdict over to the engine task. Never blocks.
    /// Returns false when the engine already dropped the flow.
    pub fn settle(self, verdict: Verdict) -> bool {
        self.verdict_tx.send(verdict).is_ok()
    }
}

/// Flow id -> held flow. Register and release are atomic per id, so a
/// concurrent resume and kill cannot both take the same flow.
#[derive(Debug, Clone, Default)]
pub struct InterceptionRegistry {
    held: Arc<DashMap<String, HeldFlow>>,
}

impl InterceptionRegistry {
    pub fn new() -> Self {
        Self {
            held: Arc::new(DashMap::new()),
        }
    }

    /// Hold `flow_id`. The returned [`PendingFlow`] resolves once a client
    /// releases the flow.
    pub fn hold(&self, flow_id: &str, phase: Phase) -> Result<PendingFlow, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.register(
            flow_id,
            HeldFlow {
                phase,
                held_at: Utc::now(),
                verdict_tx: tx,
            },
        )?;
        Ok(PendingFlow {
            flow_id: flow_id.to_string(),
            rx,
            registry: self.clone(),
            settled: false,
        })
    }

    /// Insert an entry; fails if the id is already held.
    pub fn register(&self, flow_id: &str, held: HeldFlow) -> Result<(), RegistryError> {
        match self.held.entry(flow_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyHeld(flow_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(held);
                Ok(())
            }
        }
    }

    /// Remove and return the entry. Exactly one caller wins per registration.
    pub fn release(&self, flow_id: &str) -> Option<HeldFlow> {
        self.held.remove(flow_id).map(|(_, held)| held)
    }

    /// Drop an entry the engine gave up on. No-op when already released.
    pub fn discard(&self, flow_id: &str) {
        if self.held.remove(flow_id).is_some() {
            info!("Held flow {} abandoned by the engine", flow_id);
        }
    }

    pub fn is_held(&self, flow_id: &str) -> bool {
        self.held.contains_key(flow_id)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Engine-side half of a hold.
///
/// Dropping it before a verdict arrives (the engine tore the flow down)
/// removes the registry entry, so later commands for the id miss cleanly.
#[derive(Debug)]
pub struct PendingFlow {
    flow_id: String,
    rx: oneshot::Receiver<Verdict>,
    registry: InterceptionRegistry,
    settled: bool,
}

impl PendingFlow {
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Wait for a client verdict. If the held entry disappears without one,
    /// the flow is resumed unchanged.
    pub async fn wait(mut self) -> Verdict {
        let verdict = match (&mut self.rx).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!("Held flow {} lost its registry entry, resuming unchanged", self.flow_id);
                Verdict::Resume(None)
            }
        };
        self.settled = true;
        debug!("Flow {} settled: {:?}", self.flow_id, verdict);
        verdict
    }
}

impl Drop for PendingFlow {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.discard(&self.flow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[tokio::test]
    async fn test_hold_and_resume() {
        let registry = InterceptionRegistry::new();
        let pending = registry.hold("req-123", Phase::Request).unwrap();
        assert_eq!(pending.flow_id(), "req-123");
        assert!(registry.is_held("req-123"));

        let held = registry.release("req-123").expect("held flow should be released");
        assert_eq!(held.phase, Phase::Request);
        assert!(held.held_at <= Utc::now());
        assert!(held.held_for() >= chrono::Duration::zero());
        assert!(held.settle(Verdict::Kill));

        assert_eq!(pending.wait().await, Verdict::Kill);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_is_exactly_once() {
        let registry = InterceptionRegistry::new();
        let _pending = registry.hold("f", Phase::Response).unwrap();

        assert!(registry.release("f").is_some());
        assert!(registry.release("f").is_none());
        assert!(registry.release("never-held").is_none());
    }

    #[test]
    fn test_double_register_fails() {
        let registry = InterceptionRegistry::new();
        let _pending = registry.hold("f", Phase::Request).unwrap();
        let err = registry.hold("f", Phase::Response).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyHeld("f".to_string()));
        // the first hold is untouched
        assert_eq!(registry.release("f").unwrap().phase, Phase::Request);
    }

    #[test]
    fn test_concurrent_resume_and_kill() {
        for round in 0..200 {
            let registry = InterceptionRegistry::new();
            let id = format!("flow-{}", round);
            let _pending = registry.hold(&id, Phase::Request).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = [Verdict::Resume(None), Verdict::Kill]
                .into_iter()
                .map(|verdict| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    let id = id.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        registry.release(&id).map(|held| held.settle(verdict))
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(Option::is_some)
                .count();
            assert_eq!(wins, 1, "exactly one release must succeed");
        }
    }

    #[tokio::test]
    async fn test_dropped_pending_flow_discards_entry() {
        let registry = InterceptionRegistry::new();
        let pending = registry.hold("gone", Phase::Request).unwrap();
        drop(pending);
        assert!(!registry.is_held("gone"));
        assert!(registry.release("gone").is_none());
    }

    #[tokio::test]
    async fn test_settle_after_engine_dropped_flow() {
        let registry = InterceptionRegistry::new();
        let pending = registry.hold("f", Phase::Request).unwrap();
        let held = registry.release("f").unwrap();
        drop(pending);
        assert!(!held.settle(Verdict::Resume(None)));
    }
}

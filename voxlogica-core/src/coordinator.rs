//! In-process demand deduplication.
//!
//! The first caller asking for a node gets a [`ComputePermit`] and must
//! eventually publish the outcome; everyone else gets a shared view of the
//! same future. This keeps inter-process waits on the store lease rare:
//! within one process, a node is computed by exactly one task no matter
//! how many dependents demand it.

use crate::workplan::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Terminal outcome published to waiters.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    Materialized,
    Failed { error: String },
    Killed { error: String },
    /// The permit holder went away without computing (cancellation or an
    /// infrastructure failure). Waiters should re-enter the pipeline.
    Abandoned,
}

/// What `acquire` hands back.
pub enum Acquired {
    /// Caller computes; publish through the permit when done.
    Compute(ComputePermit),
    /// Another in-process caller is computing; await the outcome.
    Wait(OutcomeWaiter),
}

struct Shared {
    inflight: Mutex<HashMap<NodeId, watch::Receiver<Option<NodeOutcome>>>>,
}

/// Process-local coordination map. Cheap to clone and share.
#[derive(Clone)]
pub struct WorkCoordinator {
    shared: Arc<Shared>,
}

impl Default for WorkCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// First caller for a node gets `Compute`; subsequent callers share a
    /// waiter until the permit publishes.
    pub fn acquire(&self, node_id: NodeId) -> Acquired {
        let mut inflight = self.shared.inflight.lock().expect("coordinator poisoned");
        if let Some(rx) = inflight.get(&node_id) {
            return Acquired::Wait(OutcomeWaiter { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(node_id, rx);
        Acquired::Compute(ComputePermit {
            node_id,
            tx: Some(tx),
            coordinator: self.clone(),
        })
    }

    /// Number of nodes currently in flight, for diagnostics.
    pub fn inflight_len(&self) -> usize {
        self.shared.inflight.lock().expect("coordinator poisoned").len()
    }

    fn finish(&self, node_id: NodeId) {
        self.shared
            .inflight
            .lock()
            .expect("coordinator poisoned")
            .remove(&node_id);
    }
}

/// Exclusive intra-process permission to compute one node.
///
/// Dropping without publishing counts as [`NodeOutcome::Abandoned`], so a
/// cancelled or crashed holder never strands its waiters.
pub struct ComputePermit {
    node_id: NodeId,
    tx: Option<watch::Sender<Option<NodeOutcome>>>,
    coordinator: WorkCoordinator,
}

impl ComputePermit {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Publish the outcome and release the in-flight entry.
    pub fn publish(mut self, outcome: NodeOutcome) {
        if let Some(tx) = self.tx.take() {
            self.coordinator.finish(self.node_id);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for ComputePermit {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.coordinator.finish(self.node_id);
            let _ = tx.send(Some(NodeOutcome::Abandoned));
        }
    }
}

/// Shared view of an in-flight computation's outcome.
pub struct OutcomeWaiter {
    rx: watch::Receiver<Option<NodeOutcome>>,
}

impl OutcomeWaiter {
    /// Await the published outcome. Cancellation-safe: dropping this future
    /// never affects the computation.
    pub async fn wait(mut self) -> NodeOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without a value; treat as abandoned.
                return NodeOutcome::Abandoned;
            }
        }
    }
}

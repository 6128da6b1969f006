use crate::CallbackEvent;
use cluster_agent_core::Delta;
use cluster_agent_k8s_api::{DynamicObject, ObjectExt};
use parking_lot::RwLock;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::mpsc;
use tracing::debug;

/// Oldest deltas are discarded once this many are pending.
const MAX_PENDING_DELTAS: usize = 1024;

pub type SharedStore = Arc<RwLock<KindStore>>;

/// The reporting view of one watched kind: its latest state-of-world and the
/// deltas observed since the last drain.
#[derive(Debug)]
pub struct KindStore {
    kind: String,
    world: Vec<Arc<DynamicObject>>,
    deltas: VecDeque<Delta>,
}

// === impl KindStore ===

impl KindStore {
    pub fn shared(kind: impl Into<String>) -> SharedStore {
        Arc::new(RwLock::new(Self {
            kind: kind.into(),
            world: Vec::new(),
            deltas: VecDeque::new(),
        }))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn len(&self) -> usize {
        self.world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world.is_empty()
    }

    pub fn apply(&mut self, ev: CallbackEvent) {
        if self.deltas.len() == MAX_PENDING_DELTAS {
            self.deltas.pop_front();
        }
        self.deltas.push_back(Delta {
            api_version: ev.object.object_api_version().to_string(),
            kind: ev.object.object_kind().to_string(),
            name: ev.object.object_name().to_string(),
            namespace: ev.object.object_namespace().to_string(),
            creation_timestamp: ev.object.creation_timestamp(),
            delta_kind: ev.event,
        });
        self.world = ev.state_of_world;
    }

    /// A shallow copy of the cached objects.
    pub fn state_of_world(&self) -> Vec<Arc<DynamicObject>> {
        self.world.clone()
    }

    /// Takes every pending delta, oldest first.
    pub fn drain_deltas(&mut self) -> Vec<Delta> {
        self.deltas.drain(..).collect()
    }
}

/// Feeds watch events into a store until the watch ends.
pub async fn run(store: SharedStore, mut events: mpsc::Receiver<CallbackEvent>) {
    while let Some(ev) = events.recv().await {
        store.write().apply(ev);
    }
    debug!(kind = %store.read().kind(), "Watch ended");
}

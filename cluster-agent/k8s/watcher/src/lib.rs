#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Watches resource kinds that may or may not be installed in the cluster,
//! publishing every change along with the kind's full cached set.

mod metrics;
mod state;
mod store;

pub use self::{
    metrics::{StoreSizes, WatchMetrics},
    store::{run, KindStore, SharedStore},
};

use self::state::WorldState;
use cluster_agent_core::{panic_message, DeltaKind};
use cluster_agent_k8s_api::{
    watcher, Api, Client, Discovered, DynamicObject, Gvr, Watch, WatchStreamExt,
};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// A single change to a watched kind.
#[derive(Clone, Debug)]
pub struct CallbackEvent {
    pub event: DeltaKind,
    pub object: Arc<DynamicObject>,
    /// The kind's cached set at the time of the event, ordered by namespace and name.
    pub state_of_world: Vec<Arc<DynamicObject>>,
}

#[derive(Clone)]
pub struct DynamicWatcher {
    client: Client,
    rediscover: Duration,
    metrics: WatchMetrics,
}

const EVENT_BUFFER: usize = 64;

// === impl DynamicWatcher ===

impl DynamicWatcher {
    pub fn new(client: Client, metrics: WatchMetrics) -> Self {
        Self {
            client,
            rediscover: Duration::from_secs(30),
            metrics,
        }
    }

    /// Sets how often an absent kind is looked up again.
    pub fn with_rediscovery(mut self, period: Duration) -> Self {
        self.rediscover = period;
        self
    }

    /// Watches `gvr` in `namespace` (or cluster-wide) until `cancel` fires.
    ///
    /// A kind that isn't served by the API server yields no events until it
    /// is installed. The channel closes once the watch is cancelled.
    pub fn watch(
        &self,
        namespace: Option<String>,
        gvr: Gvr,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<CallbackEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!(
            "watch",
            resource = %gvr,
            namespace = namespace.as_deref().unwrap_or("*"),
        );
        let this = self.clone();
        tokio::spawn(
            async move {
                let Some(found) = this.discover(&gvr, &cancel).await else {
                    return;
                };
                info!("Watching");
                let api = match namespace.as_deref() {
                    Some(ns) if found.namespaced => {
                        Api::<DynamicObject>::namespaced_with(this.client.clone(), ns, &found.resource)
                    }
                    _ => Api::<DynamicObject>::all_with(this.client.clone(), &found.resource),
                };
                let events = Watch::from(watcher(api, watcher::Config::default()).default_backoff());
                forward(events, &gvr.resource, &this.metrics, tx, cancel).await;
            }
            .instrument(span),
        );
        rx
    }

    async fn discover(&self, gvr: &Gvr, cancel: &CancellationToken) -> Option<Discovered> {
        loop {
            if let Some(found) = gvr.discover(&self.client).await {
                return Some(found);
            }
            debug!("Resource not installed");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = time::sleep(self.rediscover) => {}
            }
        }
    }
}

/// Applies watch events to a fresh world state and publishes the resulting
/// changes until the watch ends, the receiver is dropped, or `cancel` fires.
async fn forward(
    mut events: Watch<DynamicObject>,
    kind: &str,
    metrics: &WatchMetrics,
    tx: mpsc::Sender<CallbackEvent>,
    cancel: CancellationToken,
) {
    let mut world = WorldState::default();
    loop {
        let ev = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };

        let changes = match std::panic::catch_unwind(AssertUnwindSafe(|| world.apply(ev))) {
            Ok(changes) => changes,
            Err(panic) => {
                error!(panic = %panic_message(&*panic), "Recovered from panic while handling a watch event");
                continue;
            }
        };
        if changes.is_empty() {
            continue;
        }

        let state_of_world = world.snapshot();
        for (event, object) in changes {
            metrics.observe(kind, event);
            let ev = CallbackEvent {
                event,
                object,
                state_of_world: state_of_world.clone(),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = tx.send(ev) => if res.is_err() {
                    return;
                },
            }
        }
    }
}

use anyhow::{Context, Result};
use cluster_agent_core::{ApiDoc, Identity, IdentityCell, Report, SidecarSnapshot, Summary};
use cluster_agent_grpc::convert;
use cluster_agent_k8s_api::ObjectExt;
use cluster_agent_k8s_watcher::SharedStore;
use parking_lot::Mutex;
use std::time::SystemTime;

/// Builds reports from the latest snapshot, the identity and the watched kinds.
#[derive(Debug)]
pub struct Assembler {
    hostname: String,
    cluster_id: Option<String>,
    identity: Mutex<IdentityCell>,
    rollouts: SharedStore,
    applications: SharedStore,
}

/// The fingerprint of the last report that was sent.
#[derive(Debug, Default)]
pub struct ReportCache {
    last: Mutex<Option<Vec<u8>>>,
}

// === impl Assembler ===

impl Assembler {
    pub fn new(
        hostname: impl Into<String>,
        cluster_id: Option<String>,
        rollouts: SharedStore,
        applications: SharedStore,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            cluster_id: cluster_id.filter(|id| !id.is_empty()),
            identity: Default::default(),
            rollouts,
            applications,
        }
    }

    /// Records the identity carried by `snapshot` and returns the current one.
    pub fn identify(&self, snapshot: &SidecarSnapshot) -> Option<Identity> {
        let resolved = Identity::resolve(snapshot, &self.hostname, self.cluster_id.as_deref());
        let mut cell = self.identity.lock();
        if cell.observe(resolved) {
            if let Some(id) = cell.get() {
                tracing::info!(cluster_id = %id.cluster_id, version = %id.version, "Identified cluster");
            }
        }
        cell.get().cloned()
    }

    /// The most recently observed identity.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().get().cloned()
    }

    /// Assembles a report, or `None` while the cluster can't be identified.
    ///
    /// Watch deltas are drained into the report's summary.
    pub fn assemble(
        &self,
        snapshot: &SidecarSnapshot,
        api_docs: Vec<ApiDoc>,
        snapshot_ts: SystemTime,
    ) -> Result<Option<Report>> {
        let Some(identity) = self.identify(snapshot) else {
            return Ok(None);
        };

        let (argo_rollouts, mut deltas) = {
            let mut store = self.rollouts.write();
            let values = store
                .state_of_world()
                .iter()
                .map(|o| o.to_report_value())
                .collect::<Vec<_>>();
            (values, store.drain_deltas())
        };
        let argo_applications = {
            let mut store = self.applications.write();
            let values = store
                .state_of_world()
                .iter()
                .map(|o| o.to_report_value())
                .collect::<Vec<_>>();
            deltas.extend(store.drain_deltas());
            values
        };

        let summary = Summary {
            services: snapshot.services().to_vec(),
            mappings: snapshot.mappings().to_vec(),
            pods: snapshot.pods().to_vec(),
            argo_rollouts,
            argo_applications,
            api_docs,
            deltas,
        };
        let report = Report::new(identity, snapshot, summary, snapshot_ts)
            .context("failed to encode report")?;
        Ok(Some(report))
    }
}

// === impl ReportCache ===

impl ReportCache {
    /// Whether `report` matches the last sent report, ignoring its timestamp.
    pub fn is_unchanged(&self, report: &Report) -> bool {
        let fingerprint = convert::report_fingerprint(report);
        self.last.lock().as_deref() == Some(fingerprint.as_slice())
    }

    /// Records `report` as sent.
    pub fn record(&self, report: &Report) {
        *self.last.lock() = Some(convert::report_fingerprint(report));
    }

    pub fn clear(&self) {
        *self.last.lock() = None;
    }
}

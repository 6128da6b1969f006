use crate::{
    identity::Identity,
    snapshot::{Mapping, Pod, Service, SidecarSnapshot},
    API_VERSION, CONTENT_TYPE_JSON,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

/// An identity-stamped envelope carrying a sidecar snapshot and its structured summary.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub identity: Identity,
    pub api_version: String,
    pub content_type: String,
    pub snapshot_ts: Option<SystemTime>,
    pub raw_snapshot: Vec<u8>,
    pub summary: Summary,
}

/// The sidecar's diagnostics document, stamped for upload.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostics {
    pub identity: Identity,
    pub api_version: String,
    pub content_type: String,
    pub snapshot_ts: Option<SystemTime>,
    pub raw_diagnostics: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub services: Vec<Service>,
    pub mappings: Vec<Mapping>,
    pub pods: Vec<Pod>,
    pub argo_rollouts: Vec<Value>,
    pub argo_applications: Vec<Value>,
    pub api_docs: Vec<ApiDoc>,
    pub deltas: Vec<Delta>,
}

/// A single change observed on a watched resource kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    pub delta_kind: DeltaKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// An API document scraped for a mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDoc {
    pub name: String,
    pub target_ref: ObjectRef,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub version: String,
    pub data: Value,
}

#[derive(Serialize)]
struct RawView<'a> {
    #[serde(flatten)]
    snapshot: &'a SidecarSnapshot,
    summary: &'a Summary,
}

// === impl Report ===

impl Report {
    /// Builds a report whose raw snapshot is the sidecar view with the summary embedded.
    pub fn new(
        identity: Identity,
        snapshot: &SidecarSnapshot,
        summary: Summary,
        snapshot_ts: SystemTime,
    ) -> serde_json::Result<Self> {
        let raw_snapshot = serde_json::to_vec(&RawView {
            snapshot,
            summary: &summary,
        })?;
        Ok(Self {
            identity,
            api_version: API_VERSION.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            snapshot_ts: Some(snapshot_ts),
            raw_snapshot,
            summary,
        })
    }

    /// A report may only be sent once it is attributable to a cluster and carries data.
    pub fn is_emittable(&self) -> bool {
        !self.identity.cluster_id.is_empty() && !self.raw_snapshot.is_empty()
    }
}

// === impl Diagnostics ===

impl Diagnostics {
    pub fn new(identity: Identity, raw_diagnostics: Vec<u8>, snapshot_ts: SystemTime) -> Self {
        Self {
            identity,
            api_version: API_VERSION.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            snapshot_ts: Some(snapshot_ts),
            raw_diagnostics,
        }
    }
}

// === impl DeltaKind ===

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! The sidecar's serialized cluster view, as fetched by the ingester.
//!
//! Only the fields the agent consumes are typed. Everything else is carried through untouched in
//! `extra` maps so that the raw snapshot forwarded upstream loses nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Mappings routed to this location are the sidecar's own plumbing and are never reported.
pub const INTERNAL_LOCATION: &str = "--internal--";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ClusterMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesView>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMeta {
    #[serde(default, alias = "cluster_id")]
    pub cluster_id: String,

    #[serde(default)]
    pub version: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesView {
    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default)]
    pub mappings: Vec<Mapping>,

    #[serde(default)]
    pub pods: Vec<Pod>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The subset of Kubernetes object metadata the agent reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub metadata: Meta,

    #[serde(default = "active")]
    pub active: bool,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: Meta,

    #[serde(default = "active")]
    pub active: bool,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(default)]
    pub metadata: Meta,

    #[serde(default = "active")]
    pub active: bool,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,

    #[serde(default)]
    pub service: String,

    /// The `Host` header the mapping matches, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<MappingDocs>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a mapping's OpenAPI document lives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDocs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub ignored: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn active() -> bool {
    true
}

// === impl SidecarSnapshot ===

impl SidecarSnapshot {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Drops inactive and non-HTTP entries, along with mappings routed to internal locations.
    pub fn retain_reportable(&mut self) {
        if let Some(kube) = self.kubernetes.as_mut() {
            kube.services
                .retain(|svc| svc.active && svc.protocol == Protocol::Http);
            kube.pods
                .retain(|pod| pod.active && pod.protocol == Protocol::Http);
            kube.mappings.retain(|m| {
                m.active
                    && m.protocol == Protocol::Http
                    && m.location.as_deref() != Some(INTERNAL_LOCATION)
            });
        }
    }

    pub fn services(&self) -> &[Service] {
        self.kubernetes
            .as_ref()
            .map(|k| k.services.as_slice())
            .unwrap_or_default()
    }

    pub fn mappings(&self) -> &[Mapping] {
        self.kubernetes
            .as_ref()
            .map(|k| k.mappings.as_slice())
            .unwrap_or_default()
    }

    pub fn pods(&self) -> &[Pod] {
        self.kubernetes
            .as_ref()
            .map(|k| k.pods.as_slice())
            .unwrap_or_default()
    }
}

// === impl Mapping ===

impl Mapping {
    /// Mappings with a docs block that is not explicitly ignored may carry an OpenAPI document.
    pub fn has_docs(&self) -> bool {
        self.docs.as_ref().is_some_and(|d| !d.ignored)
    }

    /// A stable key for the mapping, used to track its documentation across rounds.
    pub fn key(&self) -> String {
        match self.metadata.uid.as_deref() {
            Some(uid) if !uid.is_empty() => uid.to_string(),
            _ => format!("{}.{}", self.metadata.name, self.metadata.namespace),
        }
    }
}

use crate::snapshot::SidecarSnapshot;
use serde::{Deserialize, Serialize};

/// Labels a reporting sidecar instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub cluster_id: String,
    pub hostname: String,
    pub version: String,
}

/// Holds the most recently observed identity.
///
/// Once a non-empty identity has been observed it is only replaced by another non-empty identity,
/// or cleared by an explicit [`IdentityCell::reset`].
#[derive(Clone, Debug, Default)]
pub struct IdentityCell(Option<Identity>);

// === impl Identity ===

impl Identity {
    /// Extracts an identity from a sidecar snapshot.
    ///
    /// Returns `None` when the snapshot has no cluster metadata block, or when neither the metadata
    /// nor `cluster_id_override` provides a cluster ID. The override only applies when the
    /// snapshot's own cluster ID is empty.
    pub fn resolve(
        snapshot: &SidecarSnapshot,
        hostname: &str,
        cluster_id_override: Option<&str>,
    ) -> Option<Self> {
        let meta = snapshot.meta.as_ref()?;

        let cluster_id = if meta.cluster_id.is_empty() {
            cluster_id_override.filter(|id| !id.is_empty())?
        } else {
            meta.cluster_id.as_str()
        };

        Some(Self {
            cluster_id: cluster_id.to_string(),
            hostname: hostname.to_string(),
            version: meta.version.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_id.is_empty()
    }
}

// === impl IdentityCell ===

impl IdentityCell {
    /// Records a freshly resolved identity, returning `true` if the stored identity changed.
    ///
    /// `None` and empty identities never replace a stored identity.
    pub fn observe(&mut self, identity: Option<Identity>) -> bool {
        match identity {
            Some(id) if !id.is_empty() => {
                if self.0.as_ref() == Some(&id) {
                    return false;
                }
                self.0 = Some(id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self) -> Option<&Identity> {
        self.0.as_ref()
    }

    pub fn reset(&mut self) {
        self.0 = None;
    }
}

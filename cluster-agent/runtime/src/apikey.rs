//! Resolves the control-plane API key, preferring a Secret, then a
//! ConfigMap, then the configured value.

use crate::session::Sessions;
use cluster_agent_k8s_api::{ConfigMap, DynamicObject, ObjectExt, Secret};
use cluster_agent_k8s_watcher::CallbackEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The data key holding the API key in the Secret or ConfigMap.
pub const DATA_KEY: &str = "CLOUD_CONNECT_TOKEN";

#[derive(Clone, Debug)]
pub struct ApiKeySources {
    resource_name: String,
    fallback: String,
    secret: Option<String>,
    config_map: Option<String>,
}

// === impl ApiKeySources ===

impl ApiKeySources {
    pub fn new(resource_name: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            fallback: fallback.into(),
            secret: None,
            config_map: None,
        }
    }

    /// The key from the highest-priority source present.
    pub fn resolve(&self) -> String {
        self.secret
            .clone()
            .or_else(|| self.config_map.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Updates from the namespace's current secrets.
    ///
    /// A matching secret without the data key yields an empty key.
    pub fn observe_secrets(&mut self, objects: &[Arc<DynamicObject>]) {
        self.secret = self.find(objects).map(|obj| {
            convert::<Secret>(obj)
                .and_then(|s| s.data)
                .and_then(|mut data| data.remove(DATA_KEY))
                .map(|value| String::from_utf8_lossy(&value.0).trim().to_string())
                .unwrap_or_default()
        });
    }

    pub fn observe_config_maps(&mut self, objects: &[Arc<DynamicObject>]) {
        self.config_map = self.find(objects).map(|obj| {
            convert::<ConfigMap>(obj)
                .and_then(|cm| cm.data)
                .and_then(|mut data| data.remove(DATA_KEY))
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        });
    }

    fn find<'o>(&self, objects: &'o [Arc<DynamicObject>]) -> Option<&'o DynamicObject> {
        objects
            .iter()
            .find(|o| o.object_name() == self.resource_name)
            .map(|o| &**o)
    }
}

fn convert<T: serde::de::DeserializeOwned>(obj: &DynamicObject) -> Option<T> {
    let value = serde_json::to_value(obj).ok()?;
    match serde_json::from_value(value) {
        Ok(typed) => Some(typed),
        Err(error) => {
            warn!(name = obj.object_name(), %error, "Ignoring malformed object");
            None
        }
    }
}

/// Tracks the key sources until `cancel` fires, closing the current session
/// whenever the resolved key changes.
pub async fn run(
    mut sources: ApiKeySources,
    mut secrets: mpsc::Receiver<CallbackEvent>,
    mut config_maps: mpsc::Receiver<CallbackEvent>,
    key: watch::Sender<String>,
    sessions: Arc<Sessions>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            Some(ev) = secrets.recv() => sources.observe_secrets(&ev.state_of_world),
            Some(ev) = config_maps.recv() => sources.observe_config_maps(&ev.state_of_world),
        }

        let next = sources.resolve();
        let changed = key.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            if next.is_empty() {
                info!("API key cleared");
            } else {
                info!("API key changed");
            }
            sessions.close();
        } else {
            debug!("API key unchanged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(name: &str, token: Option<&str>) -> Arc<DynamicObject> {
        let mut data = serde_json::Map::new();
        if let Some(token) = token {
            data.insert(DATA_KEY.to_string(), json!(token));
        }
        Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": name, "namespace": "agent" },
                "data": data,
            }))
            .unwrap(),
        )
    }

    fn config_map(name: &str, token: &str) -> Arc<DynamicObject> {
        Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": name, "namespace": "agent" },
                "data": { "CLOUD_CONNECT_TOKEN": token },
            }))
            .unwrap(),
        )
    }

    #[test]
    fn secret_beats_config_map_beats_fallback() {
        let mut sources = ApiKeySources::new("agent-token", "from-env");
        assert_eq!(sources.resolve(), "from-env");

        sources.observe_config_maps(&[config_map("agent-token", "from-cm")]);
        assert_eq!(sources.resolve(), "from-cm");

        // base64("from-secret")
        sources.observe_secrets(&[secret("agent-token", Some("ZnJvbS1zZWNyZXQ="))]);
        assert_eq!(sources.resolve(), "from-secret");

        sources.observe_secrets(&[]);
        assert_eq!(sources.resolve(), "from-cm");
        sources.observe_config_maps(&[config_map("other", "x")]);
        assert_eq!(sources.resolve(), "from-env");
    }

    #[test]
    fn matching_object_without_key_yields_empty_key() {
        let mut sources = ApiKeySources::new("agent-token", "from-env");
        sources.observe_secrets(&[secret("agent-token", None)]);
        assert_eq!(sources.resolve(), "");
    }
}

use crate::dispatch::ClusterOps;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use cluster_agent_core::RolloutAction;
use cluster_agent_k8s_api::{
    self as k8s, Api, ByteString, Client, DeleteParams, DynamicObject, Gvr, ObjectMeta, Patch,
    PatchParams, Secret,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

const FIELD_MANAGER: &str = "cluster-agent";

/// Performs command mutations against the Kubernetes API.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

/// The merge patches that implement a rollout action.
#[derive(Debug, Default, PartialEq)]
struct RolloutPatch {
    spec: Option<Value>,
    status: Option<Value>,
}

// === impl KubeOps ===

impl KubeOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn rollouts(&self, namespace: &str) -> Result<Api<DynamicObject>> {
        let gvr = Gvr::argo_rollouts();
        let found = gvr
            .discover(&self.client)
            .await
            .with_context(|| format!("{gvr} is not installed"))?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            namespace,
            &found.resource,
        ))
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeOps {
    async fn rollout(&self, name: &str, namespace: &str, action: RolloutAction) -> Result<()> {
        let api = self.rollouts(namespace).await?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let RolloutPatch { spec, status } = rollout_patch(action, &now);
        let params = PatchParams::default();

        if let Some(patch) = spec {
            debug!(%patch, "Patching rollout spec");
            api.patch(name, &params, &Patch::Merge(&patch))
                .await
                .with_context(|| format!("failed to {action} rollout {namespace}/{name}"))?;
        }
        if let Some(patch) = status {
            debug!(%patch, "Patching rollout status");
            api.patch_status(name, &params, &Patch::Merge(&patch))
                .await
                .with_context(|| format!("failed to {action} rollout {namespace}/{name}"))?;
        }
        Ok(())
    }

    async fn set_secret(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .with_context(|| format!("failed to apply secret {namespace}/{name}"))?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if k8s::is_not_found(&error) => {
                debug!(%namespace, %name, "Secret already absent");
                Ok(())
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete secret {namespace}/{name}"))
            }
        }
    }
}

impl std::fmt::Debug for KubeOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeOps").finish_non_exhaustive()
    }
}

fn rollout_patch(action: RolloutAction, now: &str) -> RolloutPatch {
    match action {
        RolloutAction::Pause => RolloutPatch {
            spec: Some(json!({ "spec": { "paused": true } })),
            status: None,
        },
        RolloutAction::Resume => RolloutPatch {
            spec: Some(json!({ "spec": { "paused": false } })),
            status: Some(json!({ "status": { "pauseConditions": null } })),
        },
        RolloutAction::Abort => RolloutPatch {
            spec: None,
            status: Some(json!({ "status": { "abort": true } })),
        },
        RolloutAction::Retry => RolloutPatch {
            spec: None,
            status: Some(json!({ "status": { "abort": false } })),
        },
        RolloutAction::Promote => RolloutPatch {
            spec: None,
            status: Some(json!({ "status": { "promoteFull": true } })),
        },
        RolloutAction::Restart => RolloutPatch {
            spec: Some(json!({ "spec": { "restartAt": now } })),
            status: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_patches() {
        let now = "2024-05-01T10:00:00Z";
        assert_eq!(
            rollout_patch(RolloutAction::Pause, now),
            RolloutPatch {
                spec: Some(json!({ "spec": { "paused": true } })),
                status: None,
            }
        );

        let resume = rollout_patch(RolloutAction::Resume, now);
        assert_eq!(resume.spec, Some(json!({ "spec": { "paused": false } })));
        assert_eq!(resume.status.unwrap()["status"]["pauseConditions"], Value::Null);

        assert_eq!(
            rollout_patch(RolloutAction::Abort, now).status,
            Some(json!({ "status": { "abort": true } }))
        );
        assert_eq!(
            rollout_patch(RolloutAction::Retry, now).status,
            Some(json!({ "status": { "abort": false } }))
        );
        assert_eq!(
            rollout_patch(RolloutAction::Promote, now).status,
            Some(json!({ "status": { "promoteFull": true } }))
        );
        assert_eq!(
            rollout_patch(RolloutAction::Restart, now),
            RolloutPatch {
                spec: Some(json!({ "spec": { "restartAt": now } })),
                status: None,
            }
        );
    }
}

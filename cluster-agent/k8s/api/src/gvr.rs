use crate::{ApiResource, Client};
use std::{fmt, str::FromStr};

/// A group-version-resource triple naming a resource kind on the API server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid group-version-resource {0:?}: expected resource.version[.group]")]
pub struct GvrParseError(String);

/// A kind found on the API server, along with whether it is namespaced.
#[derive(Clone, Debug)]
pub struct Discovered {
    pub resource: ApiResource,
    pub namespaced: bool,
}

// === impl Gvr ===

impl Gvr {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub fn argo_rollouts() -> Self {
        Self::new("argoproj.io", "v1alpha1", "rollouts")
    }

    pub fn argo_applications() -> Self {
        Self::new("argoproj.io", "v1alpha1", "applications")
    }

    pub fn secrets() -> Self {
        Self::new("", "v1", "secrets")
    }

    pub fn config_maps() -> Self {
        Self::new("", "v1", "configmaps")
    }

    /// The `apiVersion` of objects of this kind, e.g. `argoproj.io/v1alpha1` or `v1`.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Looks the resource up on the API server.
    ///
    /// Returns `None` when the group-version is not served or does not include the resource; a
    /// kind that is not installed is indistinguishable from an unreachable discovery endpoint.
    pub async fn discover(&self, client: &Client) -> Option<Discovered> {
        let list = if self.group.is_empty() {
            client.list_core_api_resources(&self.version).await
        } else {
            client.list_api_group_resources(&self.api_version()).await
        };

        let list = match list {
            Ok(list) => list,
            Err(error) => {
                tracing::debug!(gvr = %self, %error, "Resource group not served");
                return None;
            }
        };

        list.resources
            .iter()
            .find(|r| r.name == self.resource)
            .map(|r| Discovered {
                resource: ApiResource {
                    group: self.group.clone(),
                    version: self.version.clone(),
                    api_version: self.api_version(),
                    kind: r.kind.clone(),
                    plural: r.name.clone(),
                },
                namespaced: r.namespaced,
            })
    }
}

/// Parses the `resource.version.group` form used by `kubectl`, e.g. `rollouts.v1alpha1.argoproj.io`.
/// Core kinds omit the group: `secrets.v1` (a trailing dot is tolerated).
impl FromStr for Gvr {
    type Err = GvrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let resource = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let group = parts.next().unwrap_or_default();
        if resource.is_empty() || version.is_empty() || group.starts_with('.') {
            return Err(GvrParseError(s.to_string()));
        }
        Ok(Self::new(group, version, resource))
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

use crate::DynamicObject;
use serde_json::Value;

/// Typed accessors for the fields of schema-less objects that the agent consumes.
pub trait ObjectExt {
    fn uid(&self) -> Option<&str>;

    fn object_name(&self) -> &str;

    fn object_namespace(&self) -> &str;

    fn object_api_version(&self) -> &str;

    fn object_kind(&self) -> &str;

    /// RFC 3339 creation timestamp.
    fn creation_timestamp(&self) -> Option<String>;

    /// `spec.paused` of an Argo rollout.
    fn rollout_paused(&self) -> Option<bool>;

    /// Renders the object for reporting, without server-side bookkeeping.
    fn to_report_value(&self) -> Value;
}

impl ObjectExt for DynamicObject {
    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn object_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn object_namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn object_api_version(&self) -> &str {
        self.types
            .as_ref()
            .map(|t| t.api_version.as_str())
            .unwrap_or_default()
    }

    fn object_kind(&self) -> &str {
        self.types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or_default()
    }

    fn creation_timestamp(&self) -> Option<String> {
        self.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_string())
    }

    fn rollout_paused(&self) -> Option<bool> {
        self.data.get("spec")?.get("paused")?.as_bool()
    }

    fn to_report_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("managedFields");
        }
        value
    }
}

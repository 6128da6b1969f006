#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod directive;
mod docs_diff;
pub mod identity;
pub mod limit;
pub mod report;
pub mod snapshot;

pub use self::{
    directive::{Command, CommandKind, CommandResult, Directive, RolloutAction, SecretSyncAction},
    docs_diff::DocsDiff,
    identity::{Identity, IdentityCell},
    limit::{LimitDescriptor, Unit},
    report::{ApiDoc, Delta, DeltaKind, Diagnostics, ObjectRef, Report, Summary},
    snapshot::SidecarSnapshot,
};

/// The protocol version stamped on every report and diagnostics upload.
pub const API_VERSION: &str = "v1";

/// Reports carry JSON-encoded snapshots.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Extracts a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

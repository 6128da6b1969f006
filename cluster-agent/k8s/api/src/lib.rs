#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gvr;
pub mod object;
mod watch;

pub use self::{
    gvr::{Discovered, Gvr, GvrParseError},
    object::ObjectExt,
    watch::{Event, Watch},
};
pub use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    ByteString,
};
pub use kube::{
    api::{Api, DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams, ResourceExt},
    core::{ApiResource, GroupVersionKind},
    runtime::{watcher, WatchStreamExt},
    Client, Error,
};

/// Whether an API error is a `404 Not Found`.
pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(rsp) if rsp.code == 404)
}

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Runs the cluster agent: ingests sidecar snapshots, reports them to the
//! control plane and applies the directives it sends back.

pub use cluster_agent_core as core;
pub use cluster_agent_grpc as grpc;
pub use cluster_agent_k8s_api as k8s;
pub use cluster_agent_k8s_watcher as watcher;
pub use cluster_agent_quota as quota;

mod admin;
mod apidocs;
mod apikey;
mod args;
mod assemble;
mod control;
mod dispatch;
mod ingest;
mod metrics;
mod ops;
mod relay;
mod reporter;
mod secret;
mod session;

#[cfg(test)]
mod tests;

pub use self::{
    admin::Admin,
    apidocs::DocsScraper,
    apikey::ApiKeySources,
    args::{Args, Fatal},
    assemble::{Assembler, ReportCache},
    control::{ReportingControl, ReportingState},
    dispatch::{ClusterOps, Dispatcher, ResultSink},
    ingest::{Fetched, HttpSidecar, Ingester, SidecarSource, SidecarUrls},
    metrics::{AgentMetrics, Outcome},
    ops::KubeOps,
    relay::MetricsRelay,
    reporter::Reporter,
    secret::InternalSecret,
    session::{Connect, GrpcConnect, Sessions},
};

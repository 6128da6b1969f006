//! Protobuf messages of the `agent.Director` service.

use std::collections::BTreeMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Identity {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub version: String,
}

/// A report. Sent to the server encoded and split into [`RawSnapshotChunk`]s.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Snapshot {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<Identity>,
    #[prost(bytes = "vec", tag = "2")]
    pub raw_snapshot: Vec<u8>,
    #[prost(string, tag = "3")]
    pub content_type: String,
    #[prost(string, tag = "4")]
    pub api_version: String,
    #[prost(message, optional, tag = "5")]
    pub snapshot_ts: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RawSnapshotChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub chunk: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct SnapshotResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Diagnostics {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<Identity>,
    #[prost(bytes = "vec", tag = "2")]
    pub raw_diagnostics: Vec<u8>,
    #[prost(string, tag = "3")]
    pub content_type: String,
    #[prost(string, tag = "4")]
    pub api_version: String,
    #[prost(message, optional, tag = "5")]
    pub snapshot_ts: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RawDiagnosticsChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub chunk: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DiagnosticsResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Directive {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub stop_reporting: bool,
    #[prost(message, optional, tag = "3")]
    pub min_report_period: Option<prost_types::Duration>,
    #[prost(message, repeated, tag = "4")]
    pub commands: Vec<Command>,
    #[prost(bool, optional, tag = "5")]
    pub enforce_limits: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "command::Kind", tags = "2, 3, 4")]
    pub kind: Option<command::Kind>,
}

pub mod command {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Log(super::LogCommand),
        #[prost(message, tag = "3")]
        Rollout(super::RolloutCommand),
        #[prost(message, tag = "4")]
        SecretSync(super::SecretSyncCommand),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogCommand {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RolloutCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(enumeration = "rollout_command::Action", tag = "3")]
    pub action: i32,
}

pub mod rollout_command {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Action {
        Unspecified = 0,
        Pause = 1,
        Resume = 2,
        Abort = 3,
        Promote = 4,
        Restart = 5,
        Retry = 6,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SecretSyncCommand {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(enumeration = "secret_sync_command::Action", tag = "3")]
    pub action: i32,
    #[prost(btree_map = "string, bytes", tag = "4")]
    pub secret: BTreeMap<String, Vec<u8>>,
}

pub mod secret_sync_command {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Action {
        Unspecified = 0,
        Set = 1,
        Delete = 2,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandResult {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct CommandResultResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamMetricsMessage {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<Identity>,
    #[prost(message, repeated, tag = "2")]
    pub families: Vec<MetricFamily>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricFamily {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub help: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(message, repeated, tag = "4")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub labels: BTreeMap<String, String>,
    #[prost(double, tag = "3")]
    pub value: f64,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct StreamMetricsResponse {}

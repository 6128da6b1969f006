#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The control-plane side of the agent: a client for the `agent.Director` gRPC service.

pub mod chunk;
mod client;
pub mod conn;
pub mod convert;
mod director;
pub mod metrics;
pub mod proto;
mod transport;

pub use self::{
    client::DirectorClient,
    conn::{ConnInfo, Error},
    director::{Director, DirectiveStream, GrpcDirector},
    metrics::DirectorMetrics,
    transport::Transport,
};

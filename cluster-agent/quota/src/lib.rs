#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Quota enforcement backed by a key-value store shared by every replica.
//!
//! Count limits track in-use items in a single encrypted cell that is
//! mutated under a distributed lock. Rate limits record hits in a sorted set
//! and count the hits that fall within a trailing window.

mod count;
mod crypto;
mod limiter;
mod store;
mod window;

pub use self::{
    crypto::LimitCrypto,
    limiter::{Admission, HardLimit, Limiter},
    store::{connect, MemoryStore, Network, RedisStore, Store},
};
pub use cluster_agent_core::{LimitDescriptor, Unit};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("quota exceeded: {limit} allows at most {allowed} ({unit})")]
    Exceeded {
        limit: String,
        allowed: u64,
        unit: Unit,
    },

    #[error("usage of {0} cannot go below zero")]
    Underflow(String),

    #[error("failed to acquire the lock for {0}")]
    Lock(String),

    #[error("store: {0}")]
    Store(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("no limit named {0}")]
    UnknownLimit(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outcome of a permitted change to a limit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    /// The usage after the change.
    pub current: u64,
    /// The limit was exceeded but not enforced.
    pub soft_exceeded: bool,
}

// === impl Error ===

impl Error {
    pub(crate) fn store(error: impl std::fmt::Display) -> Self {
        Self::Store(error.to_string())
    }

    pub(crate) fn crypto(error: impl std::fmt::Display) -> Self {
        Self::Crypto(error.to_string())
    }

    pub(crate) fn exceeded(limit: &LimitDescriptor) -> Self {
        Self::Exceeded {
            limit: limit.name.clone(),
            allowed: limit.requests_per_unit,
            unit: limit.unit,
        }
    }
}

mod memory;
mod redis;

pub use self::{memory::MemoryStore, redis::RedisStore};

use crate::{Error, Result};
use std::{str::FromStr, sync::Arc, time::Duration};

/// The key-value operations limits are built on.
#[async_trait::async_trait]
pub trait Store: std::fmt::Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Sets `key` with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Sets `key` with a time-to-live only if it doesn't exist, returning
    /// whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only if it holds `value`, returning whether it was deleted.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Adds `member` to the sorted set at `key`.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Removes every member of the sorted set at `key` scored below `bound`.
    async fn zremove_below(&self, key: &str, bound: i64) -> Result<()>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// How the store address is interpreted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

/// Maximum observed usage is kept for a day.
const MAX_USAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Connects to the store at `url`.
///
/// `memory://` selects a process-local store.
pub async fn connect(url: &str, network: Network) -> Result<Arc<dyn Store>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::default()));
    }
    let store = RedisStore::connect(url, network).await?;
    Ok(Arc::new(store))
}

pub(crate) fn max_key(name: &str) -> String {
    format!("{name}-m")
}

/// Raises the maximum observed usage of a limit.
pub(crate) async fn record_max(store: &dyn Store, name: &str, value: u64) -> Result<()> {
    let key = max_key(name);
    let previous = store
        .get(&key)
        .await?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if value > previous {
        store.set_ex(&key, &value.to_string(), MAX_USAGE_TTL).await?;
    }
    Ok(())
}

pub(crate) async fn max_usage(store: &dyn Store, name: &str) -> Result<u64> {
    Ok(store
        .get(&max_key(name))
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

// === impl Network ===

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            _ => Err(Error::Store(format!("unsupported network: {s}"))),
        }
    }
}

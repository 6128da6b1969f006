use super::{Network, Store};
use crate::{Error, Result};
use ::redis::{aio::ConnectionLike, aio::ConnectionManager, Cmd, FromRedisValue};
use std::time::Duration;
use tracing::debug;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A Redis-backed store shared by every agent replica.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

// === impl RedisStore ===

impl RedisStore {
    /// Connects to `addr`, a `host:port` or `redis://` URL for TCP or a
    /// socket path for Unix.
    pub async fn connect(addr: &str, network: Network) -> Result<Self> {
        let url = match network {
            Network::Unix => format!("unix://{}", addr.trim_start_matches("unix://")),
            Network::Tcp if addr.contains("://") => addr.to_string(),
            Network::Tcp => format!("redis://{addr}"),
        };
        debug!(%url, "Connecting to store");
        let client = ::redis::Client::open(url.as_str()).map_err(Error::store)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(Error::store)?;
        Ok(Self { conn })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let value = conn.req_packed_command(cmd).await.map_err(Error::store)?;
        ::redis::from_redis_value(&value).map_err(Error::store)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(::redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query(::redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.query(
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1)),
        )
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .query(
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let deleted: i64 = self
            .query(
                ::redis::cmd("EVAL")
                    .arg(COMPARE_AND_DELETE)
                    .arg(1)
                    .arg(key)
                    .arg(value),
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.query(::redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let _: i64 = self
            .query(::redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zremove_below(&self, key: &str, bound: i64) -> Result<()> {
        let _: i64 = self
            .query(
                ::redis::cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(format!("({bound}")),
            )
            .await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.query(::redis::cmd("ZCARD").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: i64 = self
            .query(::redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

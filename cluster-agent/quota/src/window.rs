use crate::{store, Error, LimitDescriptor, Result, Store, Usage};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

/// A rate limit over a sliding window of recorded hits.
#[derive(Debug)]
pub(crate) struct WindowLimit {
    limit: LimitDescriptor,
    window: Duration,
    store: Arc<dyn Store>,
}

// === impl WindowLimit ===

impl WindowLimit {
    pub(crate) fn new(limit: LimitDescriptor, store: Arc<dyn Store>) -> Self {
        let window = limit.unit.window().unwrap_or(Duration::from_secs(1));
        Self {
            limit,
            window,
            store,
        }
    }

    /// Records a hit at the current time.
    pub(crate) async fn hit(&self, hard: bool) -> Result<Usage> {
        self.hit_at(now_millis(), hard).await
    }

    /// The number of hits within the window ending now.
    pub(crate) async fn usage(&self) -> Result<u64> {
        self.prune(now_millis()).await?;
        self.store.zcard(&self.limit.name).await
    }

    pub(crate) async fn max_usage(&self) -> Result<u64> {
        store::max_usage(&*self.store, &self.limit.name).await
    }

    async fn prune(&self, now_ms: i64) -> Result<()> {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        self.store
            .zremove_below(&self.limit.name, now_ms.saturating_sub(window_ms))
            .await
    }

    pub(crate) async fn hit_at(&self, now_ms: i64, hard: bool) -> Result<Usage> {
        self.prune(now_ms).await?;
        let next = self.store.zcard(&self.limit.name).await? + 1;

        let mut soft_exceeded = false;
        if next > self.limit.requests_per_unit {
            if hard {
                return Err(Error::exceeded(&self.limit));
            }
            warn!(limit = %self.limit.name, rate = next, allowed = self.limit.requests_per_unit, "Soft rate limit exceeded");
            soft_exceeded = true;
        }

        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        self.store.zadd(&self.limit.name, &member, now_ms).await?;
        self.store.expire(&self.limit.name, self.window).await?;
        store::record_max(&*self.store, &self.limit.name, next).await?;

        Ok(Usage {
            current: next,
            soft_exceeded,
        })
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

use crate::{store, Error, LimitCrypto, LimitDescriptor, Result, Store, Usage};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn};

const LOCK_TTL: Duration = Duration::from_secs(30);
const LOCK_ATTEMPTS: usize = 3;

/// A counter of in-use items, kept encrypted in a single cell.
#[derive(Debug)]
pub(crate) struct CountLimit {
    limit: LimitDescriptor,
    store: Arc<dyn Store>,
    crypto: LimitCrypto,
    lock_backoff: Duration,
    /// The last value written, used when the stored cell can't be decrypted.
    last_written: Mutex<Option<u64>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Increment,
    Decrement,
}

// === impl CountLimit ===

impl CountLimit {
    pub(crate) fn new(limit: LimitDescriptor, store: Arc<dyn Store>, crypto: LimitCrypto) -> Self {
        Self {
            limit,
            store,
            crypto,
            lock_backoff: Duration::from_secs(3),
            last_written: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lock_backoff(mut self, backoff: Duration) -> Self {
        self.lock_backoff = backoff;
        self
    }

    fn lock_key(&self) -> String {
        format!("{}-lock", self.limit.name)
    }

    /// Applies `change` under the cell's lock.
    pub(crate) async fn change(&self, change: Change, hard: bool) -> Result<Usage> {
        let token = self.lock().await?;
        let result = self.change_locked(change, hard).await;
        self.unlock(&token).await;
        result
    }

    /// The current usage, read without taking the lock.
    pub(crate) async fn usage(&self) -> Result<u64> {
        let value = self.read().await?;
        store::record_max(&*self.store, &self.limit.name, value).await?;
        Ok(value)
    }

    pub(crate) async fn max_usage(&self) -> Result<u64> {
        store::max_usage(&*self.store, &self.limit.name).await
    }

    async fn change_locked(&self, change: Change, hard: bool) -> Result<Usage> {
        let current = self.read().await?;
        let next = match change {
            Change::Increment => current + 1,
            Change::Decrement => current
                .checked_sub(1)
                .ok_or_else(|| Error::Underflow(self.limit.name.clone()))?,
        };

        let mut soft_exceeded = false;
        if change == Change::Increment && next > self.limit.requests_per_unit {
            if hard {
                return Err(Error::exceeded(&self.limit));
            }
            warn!(limit = %self.limit.name, usage = next, allowed = self.limit.requests_per_unit, "Soft limit exceeded");
            soft_exceeded = true;
        }

        let sealed = self.crypto.encrypt(&next.to_string())?;
        *self.last_written.lock() = Some(next);
        self.store.set(&self.limit.name, &sealed).await?;
        store::record_max(&*self.store, &self.limit.name, next).await?;

        Ok(Usage {
            current: next,
            soft_exceeded,
        })
    }

    async fn read(&self) -> Result<u64> {
        let sealed = match self.store.get(&self.limit.name).await? {
            Some(sealed) if !sealed.is_empty() => sealed,
            _ => return Ok(0),
        };
        let value = self
            .crypto
            .decrypt(&sealed)
            .and_then(|plain| plain.trim().parse::<u64>().map_err(Error::crypto));
        match value {
            Ok(value) => Ok(value),
            Err(error) => {
                // Tampered or foreign cells are discarded.
                warn!(limit = %self.limit.name, %error, "Discarding unreadable usage");
                self.store.del(&self.limit.name).await?;
                Ok(self.last_written.lock().unwrap_or(0))
            }
        }
    }

    async fn lock(&self) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let key = self.lock_key();
        for attempt in 1..=LOCK_ATTEMPTS {
            match self.store.set_nx(&key, &token, LOCK_TTL).await {
                Ok(true) => return Ok(token),
                Ok(false) => debug!(%key, attempt, "Lock is held"),
                Err(error) => debug!(%key, attempt, %error, "Failed to take lock"),
            }
            if attempt < LOCK_ATTEMPTS {
                time::sleep(self.lock_backoff).await;
            }
        }
        Err(Error::Lock(self.limit.name.clone()))
    }

    /// Releases the lock if it's still ours. A lock that expired and was
    /// taken by another holder is left alone.
    async fn unlock(&self, token: &str) {
        let key = self.lock_key();
        match self.store.compare_and_delete(&key, token).await {
            Ok(true) => {}
            Ok(false) => debug!(%key, "Lock expired before release"),
            Err(error) => warn!(%key, %error, "Failed to release lock"),
        }
    }
}

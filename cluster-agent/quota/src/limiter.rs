use crate::{
    count::{Change, CountLimit},
    window::WindowLimit,
    Error, LimitCrypto, LimitDescriptor, Result, Store, Unit, Usage,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::warn;

/// Whether limit breaches are refused (hard) or only logged (soft).
#[derive(Clone, Debug, Default)]
pub struct HardLimit {
    enabled: Arc<AtomicBool>,
    pinned: bool,
}

/// Enforces the configured limits.
#[derive(Clone, Debug)]
pub struct Limiter {
    limits: Arc<HashMap<String, Limit>>,
    hard: HardLimit,
}

#[derive(Debug)]
enum Limit {
    Count(CountLimit),
    Window(WindowLimit),
    /// The store is unreachable, so every query is refused.
    Denied(LimitDescriptor),
}

/// Permission to proceed with limited work.
///
/// Count limits stay held until the admission is released.
#[derive(Debug)]
#[must_use]
pub struct Admission {
    held: Option<String>,
    pub usage: Option<Usage>,
}

// === impl HardLimit ===

impl HardLimit {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            pinned: false,
        }
    }

    /// A flag that is always on and ignores updates.
    pub fn pinned() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            pinned: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Updates the flag, returning whether it changed.
    pub fn set(&self, enabled: bool) -> bool {
        if self.pinned {
            return false;
        }
        self.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }
}

// === impl Limiter ===

impl Limiter {
    pub fn new(
        limits: impl IntoIterator<Item = LimitDescriptor>,
        store: Arc<dyn Store>,
        crypto: LimitCrypto,
        hard: HardLimit,
    ) -> Self {
        let limits = limits
            .into_iter()
            .map(|limit| {
                let name = limit.name.clone();
                let limit = match limit.unit {
                    Unit::Count => Limit::Count(CountLimit::new(limit, store.clone(), crypto.clone())),
                    _ => Limit::Window(WindowLimit::new(limit, store.clone())),
                };
                (name, limit)
            })
            .collect();
        Self {
            limits: Arc::new(limits),
            hard,
        }
    }

    /// A limiter that refuses every configured limit, used when the store
    /// can't be reached.
    pub fn deny_all(limits: impl IntoIterator<Item = LimitDescriptor>, hard: HardLimit) -> Self {
        let limits = limits
            .into_iter()
            .map(|limit| (limit.name.clone(), Limit::Denied(limit)))
            .collect();
        Self {
            limits: Arc::new(limits),
            hard,
        }
    }

    /// A limiter without limits.
    pub fn unlimited(hard: HardLimit) -> Self {
        Self::deny_all(Vec::<LimitDescriptor>::new(), hard)
    }

    pub fn hard_limit(&self) -> &HardLimit {
        &self.hard
    }

    pub fn is_limited(&self, name: &str) -> bool {
        self.limits.contains_key(name)
    }

    /// Admits one unit of work against the limit `name`.
    ///
    /// Work without a configured limit is always admitted. Count limits are
    /// incremented until the admission is released; rate limits record a
    /// single hit.
    pub async fn admit(&self, name: &str) -> Result<Admission> {
        let hard = self.hard.is_enabled();
        match self.limits.get(name) {
            None => Ok(Admission {
                held: None,
                usage: None,
            }),
            Some(Limit::Denied(limit)) => Err(Error::exceeded(limit)),
            Some(Limit::Count(count)) => {
                let usage = count.change(Change::Increment, hard).await?;
                Ok(Admission {
                    held: Some(name.to_string()),
                    usage: Some(usage),
                })
            }
            Some(Limit::Window(window)) => {
                let usage = window.hit(hard).await?;
                Ok(Admission {
                    held: None,
                    usage: Some(usage),
                })
            }
        }
    }

    /// Releases an admission once its work is done.
    pub async fn release(&self, admission: Admission) {
        let Some(name) = admission.held else {
            return;
        };
        if let Some(Limit::Count(count)) = self.limits.get(&name) {
            if let Err(error) = count.change(Change::Decrement, self.hard.is_enabled()).await {
                warn!(limit = %name, %error, "Failed to release usage");
            }
        }
    }

    /// The current usage of the limit `name`.
    pub async fn usage(&self, name: &str) -> Result<u64> {
        match self.limits.get(name) {
            None => Err(Error::UnknownLimit(name.to_string())),
            Some(Limit::Denied(limit)) => Err(Error::exceeded(limit)),
            Some(Limit::Count(count)) => count.usage().await,
            Some(Limit::Window(window)) => window.usage().await,
        }
    }

    /// The maximum usage of the limit `name` observed within the last day.
    pub async fn max_usage(&self, name: &str) -> Result<u64> {
        match self.limits.get(name) {
            None => Err(Error::UnknownLimit(name.to_string())),
            Some(Limit::Denied(limit)) => Err(Error::exceeded(limit)),
            Some(Limit::Count(count)) => count.max_usage().await,
            Some(Limit::Window(window)) => window.max_usage().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn limiter(hard: HardLimit) -> Limiter {
        Limiter::new(
            vec![
                LimitDescriptor::count("rollouts", 1),
                LimitDescriptor::rate("secrets", Unit::PerMinute, 1),
            ],
            Arc::new(MemoryStore::default()),
            LimitCrypto::from_key([3; 32]),
            hard,
        )
    }

    #[tokio::test]
    async fn count_admissions_are_held_until_released() {
        let limiter = limiter(HardLimit::new(true));
        let first = limiter.admit("rollouts").await.unwrap();
        assert_eq!(limiter.usage("rollouts").await.unwrap(), 1);
        assert!(matches!(
            limiter.admit("rollouts").await,
            Err(Error::Exceeded { .. })
        ));

        limiter.release(first).await;
        assert_eq!(limiter.usage("rollouts").await.unwrap(), 0);
        let again = limiter.admit("rollouts").await.unwrap();
        limiter.release(again).await;
        assert_eq!(limiter.max_usage("rollouts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_admissions_are_hits() {
        let limiter = limiter(HardLimit::new(true));
        let first = limiter.admit("secrets").await.unwrap();
        limiter.release(first).await;
        assert!(limiter.admit("secrets").await.is_err());
    }

    #[tokio::test]
    async fn soft_mode_admits_breaches() {
        let hard = HardLimit::new(false);
        let limiter = limiter(hard.clone());
        let _a = limiter.admit("rollouts").await.unwrap();
        let b = limiter.admit("rollouts").await.unwrap();
        assert!(b.usage.is_some_and(|u| u.soft_exceeded));

        assert!(hard.set(true));
        assert!(limiter.admit("rollouts").await.is_err());
    }

    #[tokio::test]
    async fn unlimited_work_is_admitted() {
        let limiter = limiter(HardLimit::new(true));
        let admission = limiter.admit("widgets").await.unwrap();
        assert!(admission.usage.is_none());
        limiter.release(admission).await;
        assert!(matches!(
            limiter.usage("widgets").await,
            Err(Error::UnknownLimit(_))
        ));
    }

    #[tokio::test]
    async fn deny_all_refuses_configured_limits() {
        let limiter = Limiter::deny_all(
            vec![LimitDescriptor::count("rollouts", 10)],
            HardLimit::new(false),
        );
        assert!(matches!(
            limiter.admit("rollouts").await,
            Err(Error::Exceeded { .. })
        ));
        assert!(limiter.admit("secrets").await.is_ok());
    }

    #[test]
    fn pinned_hard_limits_ignore_updates() {
        let hard = HardLimit::pinned();
        assert!(!hard.set(false));
        assert!(hard.is_enabled());

        let hard = HardLimit::new(false);
        assert!(hard.set(true));
        assert!(!hard.set(true));
        assert!(hard.is_enabled());
    }
}

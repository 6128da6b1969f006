use crate::secret::{self, InternalSecret};
use anyhow::{Context, Result};
use cluster_agent_core::SidecarSnapshot;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The sidecar's admin endpoints.
#[async_trait::async_trait]
pub trait SidecarSource: Send + Sync + 'static {
    /// The raw JSON cluster snapshot.
    async fn snapshot(&self) -> Result<Vec<u8>>;

    /// The raw JSON diagnostics document.
    async fn diagnostics(&self) -> Result<Vec<u8>>;

    /// The Prometheus text exposition of the sidecar's metrics.
    async fn metrics(&self) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct SidecarUrls {
    pub snapshot: String,
    pub diagnostics: String,
    pub metrics: String,
}

/// A [`SidecarSource`] reached over HTTP, authenticated with the internal secret.
#[derive(Clone, Debug)]
pub struct HttpSidecar {
    client: reqwest::Client,
    urls: SidecarUrls,
    secret: InternalSecret,
}

/// Fetches and normalizes sidecar snapshots.
#[derive(Clone)]
pub struct Ingester {
    source: Arc<dyn SidecarSource>,
    last_ts: Arc<Mutex<Option<SystemTime>>>,
}

/// A parsed, filtered snapshot and the time it was fetched.
#[derive(Clone, Debug)]
pub struct Fetched {
    pub snapshot: SidecarSnapshot,
    pub fetched_at: SystemTime,
}

// === impl HttpSidecar ===

impl HttpSidecar {
    pub fn new(urls: SidecarUrls, secret: InternalSecret) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build sidecar client")?;
        Ok(Self {
            client,
            urls,
            secret,
        })
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes> {
        let rsp = self
            .client
            .get(url)
            .header(secret::HEADER, self.secret.as_str())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("unexpected response from {url}"))?;
        let body = rsp.bytes().await?;
        debug!(%url, bytes = body.len(), "Fetched");
        Ok(body)
    }
}

#[async_trait::async_trait]
impl SidecarSource for HttpSidecar {
    async fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.get(&self.urls.snapshot).await?.to_vec())
    }

    async fn diagnostics(&self) -> Result<Vec<u8>> {
        Ok(self.get(&self.urls.diagnostics).await?.to_vec())
    }

    async fn metrics(&self) -> Result<String> {
        let body = self.get(&self.urls.metrics).await?;
        String::from_utf8(body.to_vec()).context("metrics are not UTF-8")
    }
}

// === impl Ingester ===

impl Ingester {
    pub fn new(source: Arc<dyn SidecarSource>) -> Self {
        Self {
            source,
            last_ts: Default::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn SidecarSource> {
        &self.source
    }

    /// Fetches a snapshot, keeping only active HTTP entries.
    ///
    /// A body that can't be parsed is an error; no report is built from it.
    pub async fn fetch(&self) -> Result<Fetched> {
        let body = self.source.snapshot().await?;
        let mut snapshot =
            SidecarSnapshot::from_slice(&body).context("malformed sidecar snapshot")?;
        snapshot.retain_reportable();
        Ok(Fetched {
            snapshot,
            fetched_at: self.next_ts(),
        })
    }

    pub async fn fetch_diagnostics(&self) -> Result<(Vec<u8>, SystemTime)> {
        let body = self.source.diagnostics().await?;
        serde_json::from_slice::<serde_json::Value>(&body)
            .context("malformed sidecar diagnostics")?;
        Ok((body, self.next_ts()))
    }

    /// Fetch timestamps never move backwards, even if the wall clock does.
    fn next_ts(&self) -> SystemTime {
        let now = SystemTime::now();
        let mut last = self.last_ts.lock();
        let ts = match *last {
            Some(prev) if now <= prev => prev + Duration::from_micros(1),
            _ => now,
        };
        *last = Some(ts);
        ts
    }
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester").finish_non_exhaustive()
    }
}

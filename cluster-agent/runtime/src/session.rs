//! Control-plane sessions, opened lazily once a report is ready to go.

use anyhow::{bail, Context, Result};
use cluster_agent_core::{CommandResult, Directive, Identity};
use cluster_agent_grpc::{conn, ConnInfo, Director, DirectorMetrics, GrpcDirector, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Opens a [`Director`] authenticated with an API key.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self, api_key: &str) -> Result<Arc<dyn Director>>;
}

/// Connects to the control plane over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcConnect {
    conn: ConnInfo,
    extra_headers: Vec<(String, String)>,
    metrics: DirectorMetrics,
}

/// Holds the current session, replacing it when the identity or API key changes.
pub struct Sessions {
    connect: Arc<dyn Connect>,
    api_key: watch::Receiver<String>,
    directives: mpsc::Sender<Directive>,
    cancel: CancellationToken,
    current: Mutex<Option<Session>>,
}

struct Session {
    transport: Arc<Transport>,
    api_key: String,
}

// === impl GrpcConnect ===

impl GrpcConnect {
    pub fn new(
        conn: ConnInfo,
        extra_headers: Vec<(String, String)>,
        metrics: DirectorMetrics,
    ) -> Self {
        Self {
            conn,
            extra_headers,
            metrics,
        }
    }
}

impl Connect for GrpcConnect {
    fn connect(&self, api_key: &str) -> Result<Arc<dyn Director>> {
        let channel = self
            .conn
            .channel()
            .with_context(|| format!("failed to configure channel to {}", self.conn))?;
        let metadata = conn::call_metadata(api_key, &self.extra_headers)?;
        info!(addr = %self.conn, "Connecting to control plane");
        Ok(Arc::new(GrpcDirector::new(
            channel,
            metadata,
            self.metrics.clone(),
        )))
    }
}

// === impl Sessions ===

impl Sessions {
    /// Sessions are children of `cancel` and deliver directives on `directives`.
    pub fn new(
        connect: Arc<dyn Connect>,
        api_key: watch::Receiver<String>,
        directives: mpsc::Sender<Directive>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connect,
            api_key,
            directives,
            cancel,
            current: Mutex::new(None),
        }
    }

    /// Returns a session for `identity`, opening one if needed.
    ///
    /// Returns `None` while no API key is known.
    pub fn open(&self, identity: &Identity) -> Result<Option<Arc<Transport>>> {
        let api_key = self.api_key.borrow().clone();
        let mut current = self.current.lock();

        if let Some(session) = current.as_ref() {
            if session.api_key == api_key
                && session.transport.identity() == identity
                && !session.transport.is_closed()
            {
                return Ok(Some(session.transport.clone()));
            }
            debug!("Replacing control plane session");
            session.transport.close();
            *current = None;
        }

        if api_key.is_empty() {
            return Ok(None);
        }

        let director = self.connect.connect(&api_key)?;
        let transport = Arc::new(Transport::spawn(
            director,
            identity.clone(),
            self.directives.clone(),
            &self.cancel,
        ));
        *current = Some(Session {
            transport: transport.clone(),
            api_key,
        });
        Ok(Some(transport))
    }

    /// The open session, if any.
    pub fn current(&self) -> Option<Arc<Transport>> {
        self.current
            .lock()
            .as_ref()
            .filter(|s| !s.transport.is_closed())
            .map(|s| s.transport.clone())
    }

    /// Closes the open session; the next report opens a new one.
    pub fn close(&self) {
        if let Some(session) = self.current.lock().take() {
            info!("Closing control plane session");
            session.transport.close();
        }
    }

    pub async fn report_command_result(&self, result: &CommandResult) -> Result<()> {
        let Some(transport) = self.current() else {
            bail!("no control plane session");
        };
        transport
            .report_command_result(result)
            .await
            .context("failed to send command result")
    }
}

impl std::fmt::Debug for Sessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessions")
            .field("open", &self.current().is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl crate::dispatch::ResultSink for Sessions {
    async fn send(&self, result: &CommandResult) -> Result<()> {
        self.report_command_result(result).await
    }
}

use crate::{
    apidocs::DocsScraper,
    assemble::{Assembler, ReportCache},
    control::ReportingControl,
    ingest::{Fetched, Ingester},
    metrics::{AgentMetrics, Outcome},
    session::Sessions,
};
use cluster_agent_core::{Diagnostics, Report};
use cluster_agent_grpc::Transport;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the reporter checks whether a cycle is due.
const TICK: Duration = Duration::from_secs(1);

/// How long to wait before retrying a cycle that never reached the upload.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Periodically ingests a snapshot, assembles a report and uploads it.
pub struct Reporter {
    ingester: Ingester,
    assembler: Arc<Assembler>,
    docs: Option<DocsScraper>,
    cache: ReportCache,
    control: ReportingControl,
    sessions: Arc<Sessions>,
    diagnostics: bool,
    metrics: AgentMetrics,
    transport: Weak<Transport>,
}

/// How a cycle ended, which decides when the next one runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// The cycle got as far as the upload, whether or not it succeeded.
    Reported,
    /// The cycle stopped before an upload was possible.
    Retry,
}

/// When the next cycle is due.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    last_report: Option<Instant>,
    retry_at: Option<Instant>,
}

// === impl Reporter ===

impl Reporter {
    pub fn new(
        ingester: Ingester,
        assembler: Arc<Assembler>,
        control: ReportingControl,
        sessions: Arc<Sessions>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            ingester,
            assembler,
            docs: None,
            cache: ReportCache::default(),
            control,
            sessions,
            diagnostics: false,
            metrics,
            transport: Weak::new(),
        }
    }

    pub fn with_docs(mut self, docs: DocsScraper) -> Self {
        self.docs = Some(docs);
        self
    }

    /// Also uploads the sidecar's diagnostics on each cycle.
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut schedule = Schedule::default();
        let mut ticks = time::interval(TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => {}
            }

            if self.control.is_stopped() {
                continue;
            }
            if !schedule.is_due(Instant::now(), self.control.period()) {
                continue;
            }
            let cycle = self.cycle().await;
            schedule.record(Instant::now(), cycle);
        }
    }

    pub(crate) async fn cycle(&mut self) -> Cycle {
        let Fetched {
            snapshot,
            fetched_at,
        } = match self.ingester.fetch().await {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(error = %format_args!("{error:#}"), "Failed to fetch snapshot");
                return Cycle::Retry;
            }
        };

        let api_docs = match &self.docs {
            Some(docs) => {
                docs.refresh(snapshot.mappings()).await;
                docs.docs()
            }
            None => vec![],
        };

        let report = match self.assembler.assemble(&snapshot, api_docs, fetched_at) {
            Ok(Some(report)) if report.is_emittable() => report,
            Ok(_) => {
                debug!("Cluster not identified yet");
                self.metrics.report(Outcome::NotEmittable);
                return Cycle::Retry;
            }
            Err(error) => {
                warn!(error = %format_args!("{error:#}"), "Failed to assemble report");
                self.metrics.report(Outcome::NotEmittable);
                return Cycle::Retry;
            }
        };

        // A stop may have arrived while the snapshot was being fetched.
        if self.control.is_stopped() {
            return Cycle::Retry;
        }

        let transport = match self.sessions.open(&report.identity) {
            Ok(Some(transport)) => transport,
            Ok(None) => {
                debug!("No API key; not reporting");
                return Cycle::Retry;
            }
            Err(error) => {
                warn!(error = %format_args!("{error:#}"), "Failed to connect to control plane");
                self.metrics.report(Outcome::Failed);
                return Cycle::Reported;
            }
        };
        if !std::ptr::eq(self.transport.as_ptr(), Arc::as_ptr(&transport)) {
            // A new session hasn't seen any report yet.
            self.cache.clear();
            self.transport = Arc::downgrade(&transport);
        }

        self.send_report(&transport, &report).await;
        if self.diagnostics {
            self.send_diagnostics(&transport, &report).await;
        }
        Cycle::Reported
    }

    async fn send_report(&self, transport: &Transport, report: &Report) {
        if self.cache.is_unchanged(report) {
            debug!("Report unchanged");
            self.metrics.report(Outcome::Unchanged);
            return;
        }
        match transport.report(report).await {
            Ok(()) => {
                info!(
                    services = report.summary.services.len(),
                    pods = report.summary.pods.len(),
                    "Report sent"
                );
                self.cache.record(report);
                self.metrics.report(Outcome::Sent);
            }
            Err(status) => {
                warn!(code = ?status.code(), message = %status.message(), "Failed to send report");
                self.metrics.report(Outcome::Failed);
            }
        }
    }

    async fn send_diagnostics(&self, transport: &Transport, report: &Report) {
        let (raw, ts) = match self.ingester.fetch_diagnostics().await {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(error = %format_args!("{error:#}"), "Failed to fetch diagnostics");
                return;
            }
        };
        if self.control.is_stopped() {
            return;
        }
        let diagnostics = Diagnostics::new(report.identity.clone(), raw, ts);
        if let Err(status) = transport.stream_diagnostics(&diagnostics).await {
            warn!(code = ?status.code(), message = %status.message(), "Failed to send diagnostics");
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("docs", &self.docs.is_some())
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

// === impl Schedule ===

impl Schedule {
    /// A cycle is due one period after the last report finished, or once a
    /// pending retry delay has passed. The period is read on every check so
    /// a slower period applies to the cycle already scheduled.
    pub(crate) fn is_due(&self, now: Instant, period: Duration) -> bool {
        if self.retry_at.is_some_and(|at| now < at) {
            return false;
        }
        self.last_report.map_or(true, |last| now >= last + period)
    }

    /// Records a cycle that completed at `finished`.
    pub(crate) fn record(&mut self, finished: Instant, cycle: Cycle) {
        match cycle {
            Cycle::Reported => {
                self.last_report = Some(finished);
                self.retry_at = None;
            }
            Cycle::Retry => self.retry_at = Some(finished + RETRY_DELAY),
        }
    }
}

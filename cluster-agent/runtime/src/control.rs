use cluster_agent_core::directive::clamp_report_period;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

/// Reporting flow control, as set by directives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportingState {
    pub stopped: bool,
    pub period: Duration,
    pub last_directive_id: Option<String>,
}

/// Shares [`ReportingState`] between the dispatcher and the reporting workers.
#[derive(Clone, Debug)]
pub struct ReportingControl {
    tx: Arc<watch::Sender<ReportingState>>,
    floor: Duration,
}

// === impl ReportingControl ===

impl ReportingControl {
    /// Starts reporting at the local `floor` period.
    pub fn new(floor: Duration) -> Self {
        let (tx, _) = watch::channel(ReportingState {
            stopped: false,
            period: floor,
            last_directive_id: None,
        });
        Self {
            tx: Arc::new(tx),
            floor,
        }
    }

    pub fn state(&self) -> ReportingState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReportingState> {
        self.tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().stopped
    }

    pub fn period(&self) -> Duration {
        self.tx.borrow().period
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Stops or resumes reporting, returning whether the state changed.
    pub fn set_stopped(&self, stopped: bool) -> bool {
        self.tx.send_if_modified(|state| {
            let changed = state.stopped != stopped;
            state.stopped = stopped;
            changed
        })
    }

    /// Applies a server-requested period, clamped to the local floor.
    pub fn set_min_period(&self, requested: Duration) -> Duration {
        let period = clamp_report_period(requested, self.floor);
        self.tx.send_if_modified(|state| {
            let changed = state.period != period;
            state.period = period;
            changed
        });
        period
    }

    pub fn record_directive(&self, id: &str) {
        self.tx.send_if_modified(|state| {
            if state.last_directive_id.as_deref() == Some(id) {
                return false;
            }
            state.last_directive_id = Some(id.to_string());
            true
        });
    }
}

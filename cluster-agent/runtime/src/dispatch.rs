use crate::{control::ReportingControl, metrics::AgentMetrics};
use anyhow::Result;
use cluster_agent_core::{
    panic_message, Command, CommandKind, CommandResult, Directive, RolloutAction,
    SecretSyncAction,
};
use cluster_agent_quota::{self as quota, Limiter};
use futures::FutureExt;
use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// The cluster mutations commands can perform.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync + 'static {
    async fn rollout(&self, name: &str, namespace: &str, action: RolloutAction) -> Result<()>;

    async fn set_secret(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()>;

    /// Deletes a secret. A secret that doesn't exist is not an error.
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Where command results are delivered.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn send(&self, result: &CommandResult) -> Result<()>;
}

/// Applies directives: flow control first, then each command in order.
#[derive(Clone)]
pub struct Dispatcher {
    ops: Arc<dyn ClusterOps>,
    results: Arc<dyn ResultSink>,
    limiter: Limiter,
    control: ReportingControl,
    metrics: AgentMetrics,
}

const UNKNOWN_COMMAND: &str = "unknown command";

// === impl Dispatcher ===

impl Dispatcher {
    pub fn new(
        ops: Arc<dyn ClusterOps>,
        results: Arc<dyn ResultSink>,
        limiter: Limiter,
        control: ReportingControl,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            ops,
            results,
            limiter,
            control,
            metrics,
        }
    }

    /// Handles directives one at a time until the channel closes or `cancel` fires.
    pub async fn run(self, mut directives: mpsc::Receiver<Directive>, cancel: CancellationToken) {
        loop {
            let directive = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                d = directives.recv() => match d {
                    Some(d) => d,
                    None => return,
                },
            };
            let span = info_span!("directive", id = %directive.id);
            self.handle(directive).instrument(span).await;
        }
    }

    pub async fn handle(&self, directive: Directive) {
        self.metrics.directive();
        let Directive {
            id,
            stop_reporting,
            min_report_period,
            enforce_limits,
            commands,
        } = directive;

        if self.control.set_stopped(stop_reporting) {
            if stop_reporting {
                info!("Reporting stopped");
            } else {
                info!("Reporting resumed");
            }
        }
        if let Some(requested) = min_report_period {
            let period = self.control.set_min_period(requested);
            debug!(?requested, ?period, "Report period updated");
        }
        if let Some(enforce) = enforce_limits {
            if self.limiter.hard_limit().set(enforce) {
                info!(enforce, "Hard limits updated");
            }
        }

        for command in &commands {
            let Some(result) = self.execute(&id, command).await else {
                continue;
            };
            self.metrics.command_result(result.success);
            if let Err(error) = self.results.send(&result).await {
                warn!(command.id = %result.command_id, %error, "Failed to report command result");
            }
        }

        self.control.record_directive(&id);
    }

    /// Runs a command, returning its result when it carries an ID.
    ///
    /// A panic anywhere in the command, admission included, fails only that
    /// command.
    async fn execute(&self, directive: &str, command: &Command) -> Option<CommandResult> {
        let id = command.id.as_deref().filter(|id| !id.is_empty());
        let outcome = AssertUnwindSafe(self.attempt(directive, id, command))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_message(&*panic)));

        let Some(id) = id else {
            if let Err(message) = outcome {
                debug!(kind = command.kind.name(), %message, "Dropping result of command without an ID");
            }
            return None;
        };
        Some(match outcome {
            Ok(()) => CommandResult::ok(id),
            Err(message) => {
                warn!(command.id = %id, kind = command.kind.name(), %message, "Command failed");
                CommandResult::failed(id, message)
            }
        })
    }

    async fn attempt(
        &self,
        directive: &str,
        id: Option<&str>,
        command: &Command,
    ) -> Result<(), String> {
        match &command.kind {
            CommandKind::Log { message } => {
                info!(%directive, command = id.unwrap_or_default(), "{message}");
                Ok(())
            }
            CommandKind::Unknown => Err(UNKNOWN_COMMAND.to_string()),
            CommandKind::Invalid(reason) => Err(reason.clone()),
            _ => self.admit_and_run(command).await,
        }
    }

    async fn admit_and_run(&self, command: &Command) -> Result<(), String> {
        let admission = match command.limit_name() {
            Some(limit) => match self.limiter.admit(limit).await {
                Ok(admission) => Some(admission),
                Err(error) => {
                    if matches!(error, quota::Error::Exceeded { .. }) {
                        self.metrics.quota_denied(limit);
                    }
                    return Err(error.to_string());
                }
            },
            None => None,
        };

        let result = match AssertUnwindSafe(self.run_mutation(&command.kind))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(panic) => Err(panic_message(&*panic)),
        };

        if let Some(admission) = admission {
            self.limiter.release(admission).await;
        }
        result
    }

    async fn run_mutation(&self, kind: &CommandKind) -> Result<()> {
        match kind {
            CommandKind::Rollout {
                name,
                namespace,
                action,
            } => {
                info!(%name, %namespace, %action, "Applying rollout action");
                self.ops.rollout(name, namespace, *action).await
            }
            CommandKind::SecretSync {
                name,
                namespace,
                action: SecretSyncAction::Set,
                payload,
            } => {
                info!(%name, %namespace, "Syncing secret");
                self.ops
                    .set_secret(name, namespace, payload.clone().unwrap_or_default())
                    .await
            }
            CommandKind::SecretSync {
                name,
                namespace,
                action: SecretSyncAction::Delete,
                ..
            } => {
                info!(%name, %namespace, "Deleting secret");
                self.ops.delete_secret(name, namespace).await
            }
            CommandKind::Log { .. } | CommandKind::Invalid(_) | CommandKind::Unknown => {
                anyhow::bail!("{} is not a cluster mutation", kind.name())
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counters for the agent's reporting and directive handling.
#[derive(Clone, Debug, Default)]
pub struct AgentMetrics {
    reports: Family<OutcomeLabels, Counter>,
    directives: Counter,
    command_results: Family<SuccessLabels, Counter>,
    quota_denials: Family<LimitLabels, Counter>,
}

/// What became of a reporting cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Unchanged,
    Failed,
    NotEmittable,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct SuccessLabels {
    success: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct LimitLabels {
    limit: String,
}

// === impl AgentMetrics ===

impl AgentMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "reports",
            "Total number of reporting cycles by outcome",
            metrics.reports.clone(),
        );
        reg.register(
            "directives",
            "Total number of directives processed",
            metrics.directives.clone(),
        );
        reg.register(
            "command_results",
            "Total number of command results produced",
            metrics.command_results.clone(),
        );
        reg.register(
            "quota_denials",
            "Total number of commands refused by a limit",
            metrics.quota_denials.clone(),
        );
        metrics
    }

    pub(crate) fn report(&self, outcome: Outcome) {
        self.reports
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    pub(crate) fn directive(&self) {
        self.directives.inc();
    }

    pub(crate) fn command_result(&self, success: bool) {
        self.command_results
            .get_or_create(&SuccessLabels {
                success: if success { "true" } else { "false" },
            })
            .inc();
    }

    pub(crate) fn quota_denied(&self, limit: &str) {
        self.quota_denials
            .get_or_create(&LimitLabels {
                limit: limit.to_string(),
            })
            .inc();
    }
}

// === impl Outcome ===

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::NotEmittable => "not_emittable",
        }
    }
}

//! Forwards a subset of the sidecar's upstream metrics to the control plane.

use crate::{control::ReportingControl, ingest::SidecarSource, session::Sessions};
use anyhow::{Context, Result};
use cluster_agent_grpc::proto::{MetricFamily, Sample};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Only upstream request families are relayed.
const RELAYED_SUFFIXES: [&str; 3] = ["upstream_rq_total", "upstream_rq_time", "upstream_rq_5xx"];

/// Sample name suffixes that stay within their family.
const SAMPLE_SUFFIXES: [&str; 4] = ["_bucket", "_sum", "_count", "_total"];

/// The shortest interval between relayed batches.
pub const MIN_RELAY_PERIOD: Duration = Duration::from_secs(30);

pub struct MetricsRelay {
    source: Arc<dyn SidecarSource>,
    sessions: Arc<Sessions>,
    control: ReportingControl,
    period: Duration,
}

// === impl MetricsRelay ===

impl MetricsRelay {
    pub fn new(
        source: Arc<dyn SidecarSource>,
        sessions: Arc<Sessions>,
        control: ReportingControl,
        period: Duration,
    ) -> Self {
        Self {
            source,
            sessions,
            control,
            period: period.max(MIN_RELAY_PERIOD),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(self.period) => {}
            }
            match self.relay_once().await {
                Ok(0) => {}
                Ok(families) => debug!(families, "Relayed metrics"),
                Err(error) => warn!(error = %format_args!("{error:#}"), "Failed to relay metrics"),
            }
        }
    }

    /// Scrapes and relays one batch, returning the number of families sent.
    pub(crate) async fn relay_once(&self) -> Result<usize> {
        if self.control.is_stopped() {
            return Ok(0);
        }
        let Some(transport) = self.sessions.current() else {
            debug!("No control plane session");
            return Ok(0);
        };

        let text = self.source.metrics().await?;
        let families = relayed(parse(&text));
        if families.is_empty() {
            return Ok(0);
        }
        let n = families.len();
        transport
            .stream_metrics(families)
            .await
            .context("failed to stream metrics")?;
        Ok(n)
    }
}

fn relayed(families: Vec<MetricFamily>) -> Vec<MetricFamily> {
    families
        .into_iter()
        .filter(|f| RELAYED_SUFFIXES.iter().any(|s| f.name.ends_with(s)))
        .collect()
}

/// Parses the Prometheus text exposition format.
///
/// Samples are grouped under the most recent family when they carry its name
/// or its name plus a `_bucket`, `_sum`, `_count` or `_total` suffix; other
/// samples form untyped families of their own. Unparseable lines are
/// skipped.
pub(crate) fn parse(text: &str) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut help = BTreeMap::<String, String>::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.trim_start().splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("HELP"), Some(name), text) => {
                    help.insert(name.to_string(), text.unwrap_or_default().to_string());
                }
                (Some("TYPE"), Some(name), kind) => families.push(MetricFamily {
                    name: name.to_string(),
                    help: help.remove(name).unwrap_or_default(),
                    r#type: kind.unwrap_or("untyped").trim().to_string(),
                    samples: vec![],
                }),
                _ => {}
            }
            continue;
        }

        let Some(sample) = parse_sample(line) else {
            continue;
        };
        match families.last_mut() {
            Some(family) if belongs_to(&sample.name, &family.name) => family.samples.push(sample),
            _ => families.push(MetricFamily {
                name: sample.name.clone(),
                help: help.remove(&sample.name).unwrap_or_default(),
                r#type: "untyped".to_string(),
                samples: vec![sample],
            }),
        }
    }
    families
}

fn belongs_to(sample: &str, family: &str) -> bool {
    match sample.strip_prefix(family) {
        Some("") => true,
        Some(suffix) => SAMPLE_SUFFIXES.contains(&suffix),
        None => false,
    }
}

fn parse_sample(line: &str) -> Option<Sample> {
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            (&line[..open], parse_labels(&line[open + 1..close])?, &line[close + 1..])
        }
        None => {
            let split = line.find(char::is_whitespace)?;
            (&line[..split], BTreeMap::new(), &line[split..])
        }
    };
    let value = rest.split_whitespace().next()?;
    let value = match value {
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        v => v.parse().ok()?,
    };
    Some(Sample {
        name: name.trim().to_string(),
        labels,
        value,
    })
}

fn parse_labels(s: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    let mut chars = s.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(labels);
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if chars.next()? != '"' {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next()? {
                '"' => break,
                '\\' => match chars.next()? {
                    'n' => value.push('\n'),
                    c => value.push(c),
                },
                c => value.push(c),
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
}

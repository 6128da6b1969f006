use crate::{
    admin::Admin,
    apidocs::DocsScraper,
    apikey::{self, ApiKeySources},
    assemble::Assembler,
    control::ReportingControl,
    dispatch::{Dispatcher, ResultSink},
    ingest::{HttpSidecar, Ingester, SidecarUrls},
    metrics::AgentMetrics,
    ops::KubeOps,
    relay::MetricsRelay,
    reporter::Reporter,
    secret::InternalSecret,
    session::{GrpcConnect, Sessions},
};
use anyhow::anyhow;
use clap::Parser;
use cluster_agent_core::LimitDescriptor;
use cluster_agent_grpc::{ConnInfo, DirectorMetrics};
use cluster_agent_k8s_api::Gvr;
use cluster_agent_k8s_watcher::{DynamicWatcher, KindStore, StoreSizes, WatchMetrics};
use cluster_agent_quota::{self as quota, HardLimit, LimitCrypto, Limiter, Network};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, Signal, SignalKind},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const DIRECTIVE_BUFFER: usize = 16;

#[derive(Debug, Parser)]
#[clap(name = "cluster-agent", about = "Reports cluster state to a remote control plane")]
pub struct Args {
    /// One of debug, info, warn, error or fatal, or a filter directive.
    #[clap(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = parse_log_level
    )]
    log_level: String,

    #[clap(long, env = "LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(
        long,
        env = "SNAPSHOT_URL",
        default_value = "http://sidecar-admin:8005/snapshot-external"
    )]
    snapshot_url: String,

    #[clap(
        long,
        env = "DIAGNOSTICS_URL",
        default_value = "http://sidecar-admin:8877/diagnostics?json=true"
    )]
    diagnostics_url: String,

    #[clap(
        long,
        env = "METRICS_URL",
        default_value = "http://sidecar-admin:8877/metrics"
    )]
    metrics_url: String,

    /// Used when the sidecar doesn't report a cluster ID.
    #[clap(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// The shortest interval between reports, in seconds.
    #[clap(long, env = "POLL_PERIOD_SECS", default_value = "60")]
    poll_period_secs: u64,

    /// The control plane's address. An `http://` scheme disables TLS.
    #[clap(long, env = "RPC_CONNECTION_ADDRESS")]
    rpc_connection_address: Option<String>,

    /// Extra metadata sent with every RPC, as NAME=VALUE.
    #[clap(
        long = "rpc-extra-header",
        env = "RPC_EXTRA_HEADERS",
        value_delimiter = ',',
        value_parser = parse_header
    )]
    rpc_extra_headers: Vec<(String, String)>,

    #[clap(long, env = "CLOUD_CONNECT_TOKEN", hide_env_values = true)]
    api_key: Option<String>,

    /// The Secret or ConfigMap that may override the API key.
    #[clap(
        long,
        env = "AGENT_CONFIG_RESOURCE_NAME",
        default_value = "cluster-agent-cloud-token"
    )]
    api_key_resource_name: String,

    #[clap(long, env = "REPORT_DIAGNOSTICS")]
    report_diagnostics: bool,

    #[clap(long, env = "STORE_URL")]
    store_url: Option<String>,

    #[clap(long, env = "STORE_NETWORK", default_value = "tcp")]
    store_network: Network,

    /// Any value other than `false` or `0` disables reporting.
    #[clap(long, env = "TELEMETRY_DISABLE")]
    telemetry_disable: Option<String>,

    #[clap(long, env = "POD_NAMESPACE")]
    pod_namespace: Option<String>,

    #[clap(long, env = "LICENSE_CUSTOMER_ID")]
    license_customer_id: Option<String>,

    #[clap(long, env = "LICENSE_CUSTOMER_EMAIL")]
    license_customer_email: Option<String>,

    /// A quota as NAME=UNIT:VALUE, e.g. `rollouts=count:5`.
    #[clap(long = "limit", env = "QUOTA_LIMITS", value_delimiter = ',')]
    limits: Vec<LimitDescriptor>,

    /// Refuse commands that exceed their quota instead of logging them.
    #[clap(long, env = "HARD_LIMIT")]
    hard_limit: bool,

    #[clap(long, env = "ADMIN_ADDR", default_value = "0.0.0.0:8080")]
    admin_addr: SocketAddr,

    /// Restricts Argo resource watches to a namespace.
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

/// A reason the agent stopped early.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("failed to start: {0:#}")]
    Bootstrap(anyhow::Error),

    #[error("terminated by signal {0}")]
    Signal(i32),
}

struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<(), Fatal> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<(), Fatal> {
        let Self {
            log_level,
            log_format,
            client,
            snapshot_url,
            diagnostics_url,
            metrics_url,
            cluster_id,
            poll_period_secs,
            rpc_connection_address,
            rpc_extra_headers,
            api_key,
            api_key_resource_name,
            report_diagnostics,
            store_url,
            store_network,
            telemetry_disable,
            pod_namespace,
            license_customer_id,
            license_customer_email,
            limits,
            hard_limit,
            admin_addr,
            watch_namespace,
        } = self;

        let log_level = log_level
            .parse::<kubert::LogFilter>()
            .map_err(|error| Fatal::Config(anyhow!("invalid log level: {error}")))?;
        log_format
            .try_init(log_level)
            .map_err(|error| Fatal::Bootstrap(anyhow!("failed to initialize logging: {error}")))?;

        let telemetry_disabled = is_disabled(telemetry_disable.as_deref());
        let conn = if telemetry_disabled {
            info!("Telemetry disabled; not reporting");
            None
        } else {
            let address = rpc_connection_address
                .filter(|a| !a.trim().is_empty())
                .ok_or_else(|| Fatal::Config(anyhow!("--rpc-connection-address is required")))?;
            Some(ConnInfo::parse(&address).map_err(|error| Fatal::Config(error.into()))?)
        };
        let hostname = sidecar_host(&snapshot_url)?;
        let pod_namespace = resolve_namespace(pod_namespace);
        let poll_period = Duration::from_secs(poll_period_secs);

        let hard = if telemetry_disabled {
            HardLimit::pinned()
        } else {
            HardLimit::new(hard_limit)
        };
        let limiter = build_limiter(
            limits,
            store_url,
            store_network,
            license_customer_id.zip(license_customer_email),
            hard,
        )
        .await?;

        let mut signals = Signals::register()
            .map_err(|error| Fatal::Bootstrap(anyhow!("failed to register signal handlers: {error}")))?;
        let client = client
            .try_client()
            .await
            .map_err(|error| Fatal::Bootstrap(anyhow!("failed to configure Kubernetes client: {error}")))?;
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .map_err(|error| Fatal::Bootstrap(anyhow!("failed to bind {admin_addr}: {error}")))?;

        let mut prom = <Registry>::default();
        let agent_reg = prom.sub_registry_with_prefix("agent");
        let metrics = AgentMetrics::register(agent_reg);
        let watch_metrics = WatchMetrics::register(agent_reg);
        let store_sizes = StoreSizes::register(&mut prom);
        let grpc_metrics = DirectorMetrics::register(prom.sub_registry_with_prefix("grpc_client"));

        let root = CancellationToken::new();
        let mut tasks = Vec::<JoinHandle<()>>::new();

        // Argo resources are reported whenever they're installed.
        let watcher = DynamicWatcher::new(client.clone(), watch_metrics);
        let rollouts = KindStore::shared("rollouts");
        let applications = KindStore::shared("applications");
        for (store, gvr) in [
            (rollouts.clone(), Gvr::argo_rollouts()),
            (applications.clone(), Gvr::argo_applications()),
        ] {
            store_sizes.track(store.clone());
            let span = info_span!("store", kind = %store.read().kind());
            let events = watcher.watch(watch_namespace.clone(), gvr, root.clone());
            tasks.push(tokio::spawn(cluster_agent_k8s_watcher::run(store, events).instrument(span)));
        }

        if let Some(conn) = conn {
            let (key_tx, key_rx) = watch::channel(api_key.clone().unwrap_or_default());
            let (directives_tx, directives_rx) = mpsc::channel(DIRECTIVE_BUFFER);
            let connect = Arc::new(GrpcConnect::new(conn, rpc_extra_headers, grpc_metrics));
            let sessions = Arc::new(Sessions::new(connect, key_rx, directives_tx, root.clone()));

            let secrets = watcher.watch(Some(pod_namespace.clone()), Gvr::secrets(), root.clone());
            let config_maps =
                watcher.watch(Some(pod_namespace.clone()), Gvr::config_maps(), root.clone());
            let sources = ApiKeySources::new(api_key_resource_name, api_key.unwrap_or_default());
            tasks.push(tokio::spawn(
                apikey::run(
                    sources,
                    secrets,
                    config_maps,
                    key_tx,
                    sessions.clone(),
                    root.clone(),
                )
                .instrument(info_span!("apikey", namespace = %pod_namespace)),
            ));

            let control = ReportingControl::new(poll_period);
            let dispatcher = Dispatcher::new(
                Arc::new(KubeOps::new(client.clone())),
                sessions.clone() as Arc<dyn ResultSink>,
                limiter,
                control.clone(),
                metrics.clone(),
            );
            tasks.push(tokio::spawn(
                dispatcher
                    .run(directives_rx, root.clone())
                    .instrument(info_span!("dispatcher")),
            ));

            let sidecar = HttpSidecar::new(
                SidecarUrls {
                    snapshot: snapshot_url,
                    diagnostics: diagnostics_url,
                    metrics: metrics_url,
                },
                InternalSecret::generate(),
            )
            .map_err(Fatal::Bootstrap)?;
            let ingester = Ingester::new(Arc::new(sidecar));
            let relay = MetricsRelay::new(
                ingester.source().clone(),
                sessions.clone(),
                control.clone(),
                poll_period,
            );
            tasks.push(tokio::spawn(
                relay.run(root.clone()).instrument(info_span!("relay")),
            ));

            let assembler = Arc::new(Assembler::new(hostname, cluster_id, rollouts, applications));
            let docs = DocsScraper::new().map_err(Fatal::Bootstrap)?;
            let reporter = Reporter::new(ingester, assembler, control, sessions, metrics)
                .with_docs(docs)
                .with_diagnostics(report_diagnostics);
            tasks.push(tokio::spawn(
                reporter.run(root.clone()).instrument(info_span!("reporter")),
            ));
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let admin_shutdown = CancellationToken::new();
        let admin = tokio::spawn(
            Admin::new(ready_rx, root.clone(), prom)
                .serve(admin_listener, admin_shutdown.clone())
                .instrument(info_span!("admin")),
        );
        let _ = ready_tx.send(true);
        info!("Started");

        let signum = signals.recv().await;
        info!(signal = signum, "Shutting down");
        let _ = ready_tx.send(false);
        root.cancel();

        tokio::select! {
            _ = futures::future::join_all(tasks) => {}
            signum = signals.recv() => {
                warn!(signal = signum, "Exiting without draining");
                return Err(Fatal::Signal(signum));
            }
        }
        admin_shutdown.cancel();
        let _ = admin.await;
        info!("Stopped");
        Ok(())
    }
}

async fn build_limiter(
    limits: Vec<LimitDescriptor>,
    store_url: Option<String>,
    network: Network,
    license: Option<(String, String)>,
    hard: HardLimit,
) -> Result<Limiter, Fatal> {
    if limits.is_empty() {
        return Ok(Limiter::unlimited(hard));
    }
    let url = store_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Fatal::Config(anyhow!("--store-url is required when limits are configured")))?;

    let crypto = match license {
        Some((id, email)) => LimitCrypto::derive(&id, &email).map_err(|error| Fatal::Config(error.into()))?,
        None => {
            warn!("No license configured; quota cells are only readable by this process");
            LimitCrypto::from_key(rand::random())
        }
    };

    match quota::connect(&url, network).await {
        Ok(store) => Ok(Limiter::new(limits, store, crypto, hard)),
        Err(error) => {
            warn!(%error, "Quota store is unreachable; limited commands will be refused");
            Ok(Limiter::deny_all(limits, hard))
        }
    }
}

/// Maps the level names operators use onto tracing filters.
fn parse_log_level(s: &str) -> Result<String, String> {
    let s = s.trim();
    let level = if s.eq_ignore_ascii_case("fatal") {
        "error".to_string()
    } else {
        s.to_string()
    };
    level
        .parse::<kubert::LogFilter>()
        .map_err(|error| error.to_string())?;
    Ok(level)
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in {s:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn is_disabled(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !(v.eq_ignore_ascii_case("false") || v == "0"),
    }
}

/// The sidecar's host name identifies the reporting instance.
fn sidecar_host(snapshot_url: &str) -> Result<String, Fatal> {
    let url = reqwest::Url::parse(snapshot_url)
        .map_err(|error| Fatal::Config(anyhow!("invalid snapshot URL {snapshot_url:?}: {error}")))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| Fatal::Config(anyhow!("snapshot URL {snapshot_url:?} has no host")))
}

fn resolve_namespace(configured: Option<String>) -> String {
    configured
        .filter(|ns| !ns.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                .ok()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
        })
        .unwrap_or_else(|| "default".to_string())
}

// === impl Fatal ===

impl Fatal {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Bootstrap(_) => 126,
            Self::Signal(signum) => 128u8.saturating_add(u8::try_from(*signum).unwrap_or(0)),
        }
    }
}

// === impl Signals ===

impl Signals {
    const SIGINT: i32 = 2;
    const SIGTERM: i32 = 15;

    fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for SIGINT or SIGTERM, returning the signal number.
    async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => Self::SIGINT,
            _ = self.terminate.recv() => Self::SIGTERM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("cluster-agent").chain(args.iter().copied()))
            .expect("args must parse")
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.snapshot_url, "http://sidecar-admin:8005/snapshot-external");
        assert_eq!(
            args.diagnostics_url,
            "http://sidecar-admin:8877/diagnostics?json=true"
        );
        assert_eq!(args.poll_period_secs, 60);
        assert_eq!(args.api_key_resource_name, "cluster-agent-cloud-token");
        assert_eq!(args.store_network, Network::Tcp);
        assert_eq!(args.admin_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert!(args.limits.is_empty());
        assert!(!args.report_diagnostics);
        assert!(!args.hard_limit);
    }

    #[test]
    fn repeatable_options() {
        let args = parse(&[
            "--limit",
            "rollouts=count:0",
            "--limit",
            "secrets=per-minute:30,other=count:2",
            "--rpc-extra-header",
            "x-tenant=acme",
        ]);
        assert_eq!(args.limits.len(), 3);
        assert_eq!(args.limits[0], LimitDescriptor::count("rollouts", 0));
        assert_eq!(
            args.rpc_extra_headers,
            vec![("x-tenant".to_string(), "acme".to_string())]
        );

        assert!(Args::try_parse_from(["cluster-agent", "--limit", "rollouts"]).is_err());
        assert!(Args::try_parse_from(["cluster-agent", "--rpc-extra-header", "novalue"]).is_err());
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_log_level("fatal").unwrap(), "error");
        assert_eq!(parse_log_level("FATAL").unwrap(), "error");
        assert_eq!(parse_log_level("debug").unwrap(), "debug");
        assert_eq!(
            parse_log_level("cluster_agent=debug,warn").unwrap(),
            "cluster_agent=debug,warn"
        );
        assert!(parse_log_level("cluster_agent=loud").is_err());
    }

    #[test]
    fn telemetry_disable_values() {
        assert!(!is_disabled(None));
        assert!(!is_disabled(Some("")));
        assert!(!is_disabled(Some("false")));
        assert!(!is_disabled(Some("0")));
        assert!(is_disabled(Some("true")));
        assert!(is_disabled(Some("yes")));
    }

    #[test]
    fn sidecar_host_names_the_instance() {
        assert_eq!(
            sidecar_host("http://sidecar-admin:8005/snapshot-external").unwrap(),
            "sidecar-admin"
        );
        assert!(sidecar_host("not a url").is_err());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Fatal::Config(anyhow!("x")).exit_code(), 1);
        assert_eq!(Fatal::Bootstrap(anyhow!("x")).exit_code(), 126);
        assert_eq!(Fatal::Signal(15).exit_code(), 143);
        assert_eq!(Fatal::Signal(2).exit_code(), 130);
    }

    #[tokio::test]
    async fn limits_require_a_store() {
        let err = build_limiter(
            vec![LimitDescriptor::count("rollouts", 1)],
            None,
            Network::Tcp,
            None,
            HardLimit::new(true),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Fatal::Config(_)));

        let limiter = build_limiter(vec![], None, Network::Tcp, None, HardLimit::new(false))
            .await
            .unwrap();
        assert!(!limiter.is_limited("rollouts"));

        let limiter = build_limiter(
            vec![LimitDescriptor::count("rollouts", 1)],
            Some("memory://".to_string()),
            Network::Tcp,
            None,
            HardLimit::new(true),
        )
        .await
        .unwrap();
        assert!(limiter.is_limited("rollouts"));
    }
}

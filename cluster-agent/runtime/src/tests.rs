use crate::{
    assemble::Assembler,
    control::ReportingControl,
    dispatch::{ClusterOps, Dispatcher, ResultSink},
    ingest::{Ingester, SidecarSource},
    metrics::AgentMetrics,
    relay::MetricsRelay,
    reporter::{Cycle, Reporter},
    session::{Connect, Sessions},
};
use anyhow::Result;
use cluster_agent_core::{
    Command, CommandKind, CommandResult, DeltaKind, Directive, RolloutAction, SecretSyncAction,
};
use cluster_agent_grpc::{proto, Director, DirectiveStream};
use cluster_agent_k8s_api::{ApiResource, DynamicObject, GroupVersionKind};
use cluster_agent_k8s_watcher::{CallbackEvent, KindStore, SharedStore};
use cluster_agent_quota::{
    self as quota, HardLimit, LimitCrypto, LimitDescriptor, Limiter, MemoryStore, Store,
};
use futures::prelude::*;
use maplit::btreemap;
use prometheus_client::registry::Registry;
use prost::Message;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tokio_util::sync::CancellationToken;
use tonic::Status;

// === Mocks ===

#[derive(Default)]
struct MockDirector {
    sessions: Mutex<VecDeque<Vec<proto::Directive>>>,
    reports: Mutex<Vec<Vec<proto::RawSnapshotChunk>>>,
    reported_at: Mutex<Vec<time::Instant>>,
    diagnostics: Mutex<Vec<Vec<proto::RawDiagnosticsChunk>>>,
    metrics: Mutex<Vec<proto::StreamMetricsMessage>>,
    results: Mutex<Vec<proto::CommandResult>>,
}

#[async_trait::async_trait]
impl Director for MockDirector {
    async fn retrieve(&self, _: proto::Identity) -> Result<DirectiveStream, Status> {
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(directives) => Ok(Box::pin(
                stream::iter(directives.into_iter().map(Ok)).chain(stream::pending()),
            )),
            None => Ok(Box::pin(stream::pending())),
        }
    }

    async fn report_stream(&self, chunks: Vec<proto::RawSnapshotChunk>) -> Result<(), Status> {
        self.reports.lock().unwrap().push(chunks);
        self.reported_at.lock().unwrap().push(time::Instant::now());
        Ok(())
    }

    async fn stream_diagnostics(
        &self,
        chunks: Vec<proto::RawDiagnosticsChunk>,
    ) -> Result<(), Status> {
        self.diagnostics.lock().unwrap().push(chunks);
        Ok(())
    }

    async fn stream_metrics(&self, message: proto::StreamMetricsMessage) -> Result<(), Status> {
        self.metrics.lock().unwrap().push(message);
        Ok(())
    }

    async fn report_command_result(&self, result: proto::CommandResult) -> Result<(), Status> {
        self.results.lock().unwrap().push(result);
        Ok(())
    }
}

struct MockConnect {
    director: Arc<MockDirector>,
    keys: Mutex<Vec<String>>,
}

impl Connect for MockConnect {
    fn connect(&self, api_key: &str) -> Result<Arc<dyn Director>> {
        self.keys.lock().unwrap().push(api_key.to_string());
        Ok(self.director.clone())
    }
}

#[derive(Default)]
struct MockOps {
    calls: Mutex<Vec<String>>,
    panic: bool,
}

#[async_trait::async_trait]
impl ClusterOps for MockOps {
    async fn rollout(&self, name: &str, namespace: &str, action: RolloutAction) -> Result<()> {
        if self.panic {
            panic!("rollout {name} exploded");
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("rollout {namespace}/{name} {action}"));
        Ok(())
    }

    async fn set_secret(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set {namespace}/{name} {}", data.len()));
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete {namespace}/{name}"));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<CommandResult>>);

#[async_trait::async_trait]
impl ResultSink for RecordingSink {
    async fn send(&self, result: &CommandResult) -> Result<()> {
        self.0.lock().unwrap().push(result.clone());
        Ok(())
    }
}

/// A sidecar whose first snapshot is slow and whose pods change on every fetch.
#[derive(Default)]
struct SlowSidecar {
    fetches: AtomicUsize,
}

#[async_trait::async_trait]
impl SidecarSource for SlowSidecar {
    async fn snapshot(&self) -> Result<Vec<u8>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            time::sleep(Duration::from_secs(8)).await;
        }
        let mut snapshot = cold_start_snapshot();
        snapshot["kubernetes"]["pods"][0]["metadata"]["name"] = json!(format!("a-{n}"));
        Ok(serde_json::to_vec(&snapshot)?)
    }

    async fn diagnostics(&self) -> Result<Vec<u8>> {
        Ok(b"{}".to_vec())
    }

    async fn metrics(&self) -> Result<String> {
        Ok(String::new())
    }
}

/// A store that panics on every call.
#[derive(Debug)]
struct BrokenStore;

#[async_trait::async_trait]
impl Store for BrokenStore {
    async fn get(&self, key: &str) -> quota::Result<Option<String>> {
        panic!("get {key} exploded")
    }

    async fn set(&self, key: &str, _: &str) -> quota::Result<()> {
        panic!("set {key} exploded")
    }

    async fn set_ex(&self, key: &str, _: &str, _: Duration) -> quota::Result<()> {
        panic!("set_ex {key} exploded")
    }

    async fn set_nx(&self, key: &str, _: &str, _: Duration) -> quota::Result<bool> {
        panic!("set_nx {key} exploded")
    }

    async fn compare_and_delete(&self, key: &str, _: &str) -> quota::Result<bool> {
        panic!("compare_and_delete {key} exploded")
    }

    async fn del(&self, key: &str) -> quota::Result<()> {
        panic!("del {key} exploded")
    }

    async fn zadd(&self, key: &str, _: &str, _: i64) -> quota::Result<()> {
        panic!("zadd {key} exploded")
    }

    async fn zremove_below(&self, key: &str, _: i64) -> quota::Result<()> {
        panic!("zremove_below {key} exploded")
    }

    async fn zcard(&self, key: &str) -> quota::Result<u64> {
        panic!("zcard {key} exploded")
    }

    async fn expire(&self, key: &str, _: Duration) -> quota::Result<()> {
        panic!("expire {key} exploded")
    }
}

struct StaticSidecar {
    snapshot: Mutex<Value>,
    metrics: String,
}

#[async_trait::async_trait]
impl SidecarSource for StaticSidecar {
    async fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.snapshot.lock().unwrap())?)
    }

    async fn diagnostics(&self) -> Result<Vec<u8>> {
        Ok(br#"{"system":{"healthy":true}}"#.to_vec())
    }

    async fn metrics(&self) -> Result<String> {
        Ok(self.metrics.clone())
    }
}

// === Fixtures ===

const FLOOR: Duration = Duration::from_secs(60);

fn cold_start_snapshot() -> Value {
    json!({
        "meta": { "clusterId": "cid-1", "version": "3.1.0" },
        "kubernetes": {
            "services": [
                { "metadata": { "name": "a", "namespace": "default" } },
                { "metadata": { "name": "b", "namespace": "default" } },
                { "metadata": { "name": "c", "namespace": "default" } },
            ],
            "pods": [
                { "metadata": { "name": "a-1", "namespace": "default" } },
                { "metadata": { "name": "b-1", "namespace": "default" } },
            ],
        },
    })
}

fn rollout(name: &str, namespace: &str) -> Arc<DynamicObject> {
    let ar = ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Rollout"),
        "rollouts",
    );
    let mut obj = DynamicObject::new(name, &ar).within(namespace);
    obj.data = json!({ "spec": { "paused": false } });
    Arc::new(obj)
}

struct Agent {
    director: Arc<MockDirector>,
    connect: Arc<MockConnect>,
    sidecar: Arc<StaticSidecar>,
    rollouts: SharedStore,
    control: ReportingControl,
    sessions: Arc<Sessions>,
    api_key: watch::Sender<String>,
    directives: Option<mpsc::Receiver<Directive>>,
    metrics: AgentMetrics,
    registry: Registry,
    root: CancellationToken,
}

impl Agent {
    fn new(api_key: &str) -> Self {
        let director = Arc::new(MockDirector::default());
        let connect = Arc::new(MockConnect {
            director: director.clone(),
            keys: Default::default(),
        });
        let sidecar = Arc::new(StaticSidecar {
            snapshot: Mutex::new(cold_start_snapshot()),
            metrics: concat!(
                "# TYPE envoy_cluster_upstream_rq_total counter\n",
                "envoy_cluster_upstream_rq_total{envoy_cluster_name=\"a\"} 3\n",
                "# TYPE envoy_server_uptime gauge\n",
                "envoy_server_uptime 10\n",
            )
            .to_string(),
        });
        let (api_key, key_rx) = watch::channel(api_key.to_string());
        let (directives_tx, directives_rx) = mpsc::channel(4);
        let root = CancellationToken::new();
        let sessions = Arc::new(Sessions::new(
            connect.clone(),
            key_rx,
            directives_tx,
            root.clone(),
        ));
        let mut registry = Registry::with_prefix("agent");
        let metrics = AgentMetrics::register(&mut registry);
        Self {
            director,
            connect,
            sidecar,
            rollouts: KindStore::shared("rollouts"),
            control: ReportingControl::new(FLOOR),
            sessions,
            api_key,
            directives: Some(directives_rx),
            metrics,
            registry,
            root,
        }
    }

    fn reporter(&self) -> Reporter {
        let assembler = Arc::new(Assembler::new(
            "sidecar-admin",
            None,
            self.rollouts.clone(),
            KindStore::shared("applications"),
        ));
        Reporter::new(
            Ingester::new(self.sidecar.clone()),
            assembler,
            self.control.clone(),
            self.sessions.clone(),
            self.metrics.clone(),
        )
    }

    fn dispatcher(
        &self,
        ops: Arc<MockOps>,
        results: Arc<dyn ResultSink>,
        limiter: Limiter,
    ) -> Dispatcher {
        Dispatcher::new(
            ops,
            results,
            limiter,
            self.control.clone(),
            self.metrics.clone(),
        )
    }

    fn reports(&self) -> Vec<Value> {
        self.director
            .reports
            .lock()
            .unwrap()
            .iter()
            .map(|chunks| {
                let payload = chunks.iter().flat_map(|c| c.chunk.clone()).collect::<Vec<_>>();
                let snapshot = proto::Snapshot::decode(payload.as_slice()).expect("snapshot must decode");
                let identity = snapshot.identity.expect("identity must be set");
                let mut raw: Value =
                    serde_json::from_slice(&snapshot.raw_snapshot).expect("raw snapshot must be JSON");
                raw["identity"] = json!({
                    "clusterId": identity.cluster_id,
                    "hostname": identity.hostname,
                });
                raw
            })
            .collect()
    }

    fn metrics_text(&self) -> String {
        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &self.registry).unwrap();
        text
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn unlimited() -> Limiter {
    Limiter::unlimited(HardLimit::new(false))
}

fn directive(id: &str, commands: Vec<Command>) -> Directive {
    Directive {
        id: id.to_string(),
        commands,
        ..Default::default()
    }
}

fn results(sink: &RecordingSink) -> Vec<CommandResult> {
    sink.0.lock().unwrap().clone()
}

// === Reporting ===

#[tokio::test]
async fn cold_start_reports_once() {
    let agent = Agent::new("key-1");
    let mut reporter = agent.reporter();

    assert_eq!(reporter.cycle().await, Cycle::Reported);
    let reports = agent.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report["identity"]["clusterId"], "cid-1");
    assert_eq!(report["identity"]["hostname"], "sidecar-admin");
    assert_eq!(report["summary"]["services"].as_array().unwrap().len(), 3);
    assert_eq!(report["summary"]["pods"].as_array().unwrap().len(), 2);
    assert_eq!(report["summary"]["argoRollouts"], json!([]));
    assert_eq!(report["summary"]["argoApplications"], json!([]));
    assert_eq!(*agent.connect.keys.lock().unwrap(), vec!["key-1"]);

    // Nothing changed, so nothing is sent.
    assert_eq!(reporter.cycle().await, Cycle::Reported);
    assert_eq!(agent.reports().len(), 1);
    let text = agent.metrics_text();
    assert!(text.contains("agent_reports_total{outcome=\"sent\"} 1"), "{text}");
    assert!(text.contains("agent_reports_total{outcome=\"unchanged\"} 1"), "{text}");
}

#[tokio::test]
async fn watched_rollouts_are_reported() {
    let agent = Agent::new("key-1");
    let mut reporter = agent.reporter();
    reporter.cycle().await;

    let r1 = rollout("r1", "ns1");
    agent.rollouts.write().apply(CallbackEvent {
        event: DeltaKind::Added,
        object: r1.clone(),
        state_of_world: vec![r1],
    });

    assert_eq!(reporter.cycle().await, Cycle::Reported);
    let reports = agent.reports();
    assert_eq!(reports.len(), 2);
    let rollouts = reports[1]["summary"]["argoRollouts"].as_array().unwrap();
    assert_eq!(rollouts.len(), 1);
    assert_eq!(rollouts[0]["metadata"]["name"], "r1");
    assert_eq!(rollouts[0]["metadata"]["namespace"], "ns1");
    assert_eq!(reports[1]["summary"]["deltas"][0]["deltaKind"], "added");
}

#[tokio::test]
async fn unidentified_clusters_are_not_reported() {
    let agent = Agent::new("key-1");
    *agent.sidecar.snapshot.lock().unwrap() = json!({ "kubernetes": { "services": [] } });
    let mut reporter = agent.reporter();

    assert_eq!(reporter.cycle().await, Cycle::Retry);
    assert!(agent.reports().is_empty());
    assert!(agent.connect.keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_snapshots_are_reported_once_identified() {
    let agent = Agent::new("key-1");
    *agent.sidecar.snapshot.lock().unwrap() = json!({ "meta": { "clusterId": "cid-1" } });
    let mut reporter = agent.reporter();

    assert_eq!(reporter.cycle().await, Cycle::Reported);
    let reports = agent.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["summary"]["services"], json!([]));
}

#[tokio::test]
async fn no_reports_without_an_api_key() {
    let agent = Agent::new("");
    let mut reporter = agent.reporter();

    assert_eq!(reporter.cycle().await, Cycle::Retry);
    assert!(agent.reports().is_empty());

    // A key arriving later is used for the next cycle.
    agent.api_key.send("key-2".to_string()).unwrap();
    assert_eq!(reporter.cycle().await, Cycle::Reported);
    assert_eq!(agent.reports().len(), 1);
    assert_eq!(*agent.connect.keys.lock().unwrap(), vec!["key-2"]);
}

#[tokio::test]
async fn key_changes_reconnect_and_resend() {
    let agent = Agent::new("key-1");
    let mut reporter = agent.reporter();
    reporter.cycle().await;

    agent.api_key.send("key-2".to_string()).unwrap();
    agent.sessions.close();
    assert_eq!(reporter.cycle().await, Cycle::Reported);

    // The new session gets the unchanged report too.
    assert_eq!(agent.reports().len(), 2);
    assert_eq!(*agent.connect.keys.lock().unwrap(), vec!["key-1", "key-2"]);
}

#[tokio::test]
async fn diagnostics_follow_reports() {
    let agent = Agent::new("key-1");
    let mut reporter = agent.reporter().with_diagnostics(true);

    reporter.cycle().await;
    assert_eq!(agent.reports().len(), 1);
    let uploads = agent.director.diagnostics.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    let payload = uploads[0].iter().flat_map(|c| c.chunk.clone()).collect::<Vec<_>>();
    let diagnostics = proto::Diagnostics::decode(payload.as_slice()).unwrap();
    assert_eq!(diagnostics.identity.unwrap().cluster_id, "cid-1");
    assert_eq!(diagnostics.content_type, "application/json");
}

// === Directives ===

#[tokio::test]
async fn rollout_pause_succeeds() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps::default());
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = agent.dispatcher(ops.clone(), sink.clone(), unlimited());

    dispatcher
        .handle(directive(
            "d1",
            vec![Command::rollout("c1", "r1", "ns1", RolloutAction::Pause)],
        ))
        .await;

    assert_eq!(results(&sink), vec![CommandResult::ok("c1")]);
    assert_eq!(*ops.calls.lock().unwrap(), vec!["rollout ns1/r1 pause"]);
    assert_eq!(
        agent.control.state().last_directive_id.as_deref(),
        Some("d1")
    );
}

#[tokio::test]
async fn hard_limits_refuse_commands() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps::default());
    let sink = Arc::new(RecordingSink::default());
    let limiter = Limiter::new(
        vec![LimitDescriptor::count("rollouts", 0)],
        Arc::new(MemoryStore::default()),
        LimitCrypto::from_key([7; 32]),
        HardLimit::new(true),
    );
    let dispatcher = agent.dispatcher(ops.clone(), sink.clone(), limiter);

    dispatcher
        .handle(directive(
            "d1",
            vec![Command::rollout("c1", "r1", "ns1", RolloutAction::Pause)],
        ))
        .await;

    let results = results(&sink);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].command_id, "c1");
    assert!(!results[0].success);
    assert!(results[0].message.contains("quota"), "{}", results[0].message);
    assert!(ops.calls.lock().unwrap().is_empty());

    let text = agent.metrics_text();
    assert!(
        text.contains("agent_quota_denials_total{limit=\"rollouts\"} 1"),
        "{text}"
    );
}

#[tokio::test]
async fn control_plane_can_lift_hard_limits() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps::default());
    let sink = Arc::new(RecordingSink::default());
    let limiter = Limiter::new(
        vec![LimitDescriptor::count("rollouts", 0)],
        Arc::new(MemoryStore::default()),
        LimitCrypto::from_key([7; 32]),
        HardLimit::new(true),
    );
    let dispatcher = agent.dispatcher(ops.clone(), sink.clone(), limiter);

    dispatcher
        .handle(Directive {
            id: "d1".to_string(),
            enforce_limits: Some(false),
            commands: vec![Command::rollout("c1", "r1", "ns1", RolloutAction::Pause)],
            ..Default::default()
        })
        .await;

    assert_eq!(results(&sink), vec![CommandResult::ok("c1")]);
    assert_eq!(ops.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn report_period_is_clamped_to_the_floor() {
    let agent = Agent::new("key-1");
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = agent.dispatcher(Arc::new(MockOps::default()), sink, unlimited());

    dispatcher
        .handle(Directive {
            id: "d2".to_string(),
            min_report_period: Some(Duration::from_secs(300)),
            ..Default::default()
        })
        .await;
    assert_eq!(agent.control.period(), Duration::from_secs(300));

    dispatcher
        .handle(Directive {
            id: "d3".to_string(),
            min_report_period: Some(Duration::from_secs(10)),
            ..Default::default()
        })
        .await;
    assert_eq!(agent.control.period(), FLOOR);
}

#[tokio::test(start_paused = true)]
async fn reports_are_a_period_apart_after_slow_cycles() {
    let agent = Agent::new("key-1");
    let assembler = Arc::new(Assembler::new(
        "sidecar-admin",
        None,
        agent.rollouts.clone(),
        KindStore::shared("applications"),
    ));
    let reporter = Reporter::new(
        Ingester::new(Arc::new(SlowSidecar::default())),
        assembler,
        agent.control.clone(),
        agent.sessions.clone(),
        agent.metrics.clone(),
    );
    tokio::spawn(reporter.run(agent.root.clone()));

    time::sleep(Duration::from_secs(200)).await;

    let sent = agent.director.reported_at.lock().unwrap().clone();
    assert!(sent.len() >= 3, "{} reports sent", sent.len());
    for pair in sent.windows(2) {
        assert!(pair[1] - pair[0] >= FLOOR, "reports {:?} apart", pair[1] - pair[0]);
    }
}

#[tokio::test]
async fn stop_and_resume_reporting() {
    let agent = Agent::new("key-1");
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = agent.dispatcher(Arc::new(MockOps::default()), sink, unlimited());
    let mut reporter = agent.reporter();

    dispatcher
        .handle(Directive {
            id: "d3".to_string(),
            stop_reporting: true,
            ..Default::default()
        })
        .await;
    assert!(agent.control.is_stopped());
    assert_eq!(reporter.cycle().await, Cycle::Retry);
    assert!(agent.reports().is_empty());

    dispatcher
        .handle(Directive {
            id: "d4".to_string(),
            stop_reporting: false,
            ..Default::default()
        })
        .await;
    assert!(!agent.control.is_stopped());
    assert_eq!(reporter.cycle().await, Cycle::Reported);
    assert_eq!(agent.reports().len(), 1);
}

#[tokio::test]
async fn results_follow_command_order() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps::default());
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = agent.dispatcher(ops.clone(), sink.clone(), unlimited());

    dispatcher
        .handle(directive(
            "d1",
            vec![
                Command::log("c1", "hello"),
                Command {
                    id: Some("c2".to_string()),
                    kind: CommandKind::SecretSync {
                        name: "creds".to_string(),
                        namespace: "apps".to_string(),
                        action: SecretSyncAction::Set,
                        payload: Some(btreemap! { "token".to_string() => b"abc".to_vec() }),
                    },
                },
                Command {
                    id: None,
                    kind: CommandKind::Log {
                        message: "no id".to_string(),
                    },
                },
                Command {
                    id: Some("c3".to_string()),
                    kind: CommandKind::SecretSync {
                        name: "creds".to_string(),
                        namespace: "apps".to_string(),
                        action: SecretSyncAction::Delete,
                        payload: None,
                    },
                },
            ],
        ))
        .await;

    let ids = results(&sink)
        .into_iter()
        .map(|r| (r.command_id, r.success))
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            ("c1".to_string(), true),
            ("c2".to_string(), true),
            ("c3".to_string(), true),
        ]
    );
    assert_eq!(
        *ops.calls.lock().unwrap(),
        vec!["set apps/creds 1", "delete apps/creds"]
    );
}

#[tokio::test]
async fn unknown_commands_fail_only_with_an_id() {
    let agent = Agent::new("key-1");
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = agent.dispatcher(Arc::new(MockOps::default()), sink.clone(), unlimited());

    dispatcher
        .handle(directive(
            "d1",
            vec![
                Command {
                    id: Some("c1".to_string()),
                    kind: CommandKind::Unknown,
                },
                Command {
                    id: None,
                    kind: CommandKind::Unknown,
                },
                Command {
                    id: Some(String::new()),
                    kind: CommandKind::Unknown,
                },
            ],
        ))
        .await;

    assert_eq!(
        results(&sink),
        vec![CommandResult::failed("c1", "unknown command")]
    );
}

#[tokio::test]
async fn panicking_commands_fail() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps {
        panic: true,
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let limiter = Limiter::new(
        vec![LimitDescriptor::count("rollouts", 1)],
        Arc::new(MemoryStore::default()),
        LimitCrypto::from_key([7; 32]),
        HardLimit::new(true),
    );
    let dispatcher = agent.dispatcher(ops, sink.clone(), limiter.clone());

    let pause = || {
        directive(
            "d1",
            vec![Command::rollout("c1", "r1", "ns1", RolloutAction::Pause)],
        )
    };
    dispatcher.handle(pause()).await;
    let first = results(&sink);
    assert_eq!(first.len(), 1);
    assert!(!first[0].success);
    assert!(first[0].message.contains("rollout r1 exploded"), "{}", first[0].message);

    // The admission was released, so the next command is admitted again.
    assert_eq!(limiter.usage("rollouts").await.unwrap(), 0);
    dispatcher.handle(pause()).await;
    assert!(results(&sink)[1].message.contains("exploded"));
}

#[tokio::test]
async fn panicking_admissions_fail_only_their_command() {
    let agent = Agent::new("key-1");
    let ops = Arc::new(MockOps::default());
    let sink = Arc::new(RecordingSink::default());
    let limiter = Limiter::new(
        vec![LimitDescriptor::count("rollouts", 5)],
        Arc::new(BrokenStore),
        LimitCrypto::from_key([7; 32]),
        HardLimit::new(true),
    );
    let dispatcher = agent.dispatcher(ops.clone(), sink.clone(), limiter);

    dispatcher
        .handle(directive(
            "d1",
            vec![
                Command::rollout("c1", "r1", "ns1", RolloutAction::Pause),
                Command::log("c2", "still here"),
            ],
        ))
        .await;

    let sent = results(&sink);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].command_id, "c1");
    assert!(!sent[0].success);
    assert!(sent[0].message.contains("exploded"), "{}", sent[0].message);
    assert_eq!(sent[1], CommandResult::ok("c2"));
    assert!(ops.calls.lock().unwrap().is_empty());
    assert_eq!(agent.control.state().last_directive_id.as_deref(), Some("d1"));
}

// === End to end ===

#[tokio::test]
async fn directives_flow_through_the_session() {
    let mut agent = Agent::new("key-1");
    agent.director.sessions.lock().unwrap().push_back(vec![proto::Directive {
        id: "d1".to_string(),
        commands: vec![proto::Command {
            id: "c1".to_string(),
            kind: Some(proto::command::Kind::Rollout(proto::RolloutCommand {
                name: "r1".to_string(),
                namespace: "ns1".to_string(),
                action: proto::rollout_command::Action::Pause as i32,
            })),
        }],
        ..Default::default()
    }]);

    let ops = Arc::new(MockOps::default());
    let dispatcher = agent.dispatcher(ops.clone(), agent.sessions.clone(), unlimited());
    let directives = agent.directives.take().unwrap();
    tokio::spawn(dispatcher.run(directives, agent.root.clone()));

    // The first report opens the session that retrieves directives.
    let mut reporter = agent.reporter();
    assert_eq!(reporter.cycle().await, Cycle::Reported);

    time::timeout(Duration::from_secs(5), async {
        while agent.director.results.lock().unwrap().is_empty() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a command result must be reported");

    let results = agent.director.results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].command_id, "c1");
    assert!(results[0].success);
    assert_eq!(*ops.calls.lock().unwrap(), vec!["rollout ns1/r1 pause"]);
}

#[tokio::test]
async fn relays_upstream_metrics() {
    let agent = Agent::new("key-1");
    let relay = MetricsRelay::new(
        agent.sidecar.clone(),
        agent.sessions.clone(),
        agent.control.clone(),
        Duration::from_secs(1),
    );

    // Without a session there is nothing to relay to.
    assert_eq!(relay_once(&relay).await, 0);

    agent.reporter().cycle().await;
    assert_eq!(relay_once(&relay).await, 1);
    let sent = agent.director.metrics.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].identity.as_ref().unwrap().cluster_id, "cid-1");
    assert_eq!(sent[0].families[0].name, "envoy_cluster_upstream_rq_total");

    agent.control.set_stopped(true);
    assert_eq!(relay_once(&relay).await, 0);
}

async fn relay_once(relay: &MetricsRelay) -> usize {
    relay.relay_once().await.expect("relay must succeed")
}

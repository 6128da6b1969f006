//! Metrics for calls to the control plane.
//!
//! Uploads are one-shot calls, so each is recorded once with its chunk
//! count, duration and status. The directive stream is long-lived and is
//! tracked by the directives it delivers and the status it ends with.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;
use tonic::{Code, Status};

#[derive(Clone, Debug)]
pub struct DirectorMetrics {
    uploads: Family<UploadLabels, Counter>,
    upload_chunks: Family<RpcLabels, Histogram>,
    upload_duration: Family<RpcLabels, Histogram>,
    streams_opened: Counter,
    streams_ended: Family<CodeLabels, Counter>,
    directives: Counter,
}

/// The calls that carry data to the control plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Upload {
    Report,
    Diagnostics,
    Metrics,
    CommandResult,
}

/// Records one upload when it finishes, or as cancelled if it's dropped.
#[must_use]
pub(crate) struct UploadTimer {
    metrics: DirectorMetrics,
    rpc: Upload,
    start: Option<time::Instant>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RpcLabels {
    rpc: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct UploadLabels {
    rpc: &'static str,
    grpc_code: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_code: String,
}

// === impl DirectorMetrics ===

impl DirectorMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let uploads = Family::<UploadLabels, Counter>::default();
        reg.register(
            "uploads",
            "Uploads to the control plane by call and status",
            uploads.clone(),
        );

        let upload_chunks = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([1.0, 2.0, 4.0, 16.0, 64.0, 256.0])
        });
        reg.register(
            "upload_chunks",
            "Messages written per upload",
            upload_chunks.clone(),
        );

        let upload_duration = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.25, 1.0, 5.0, 30.0])
        });
        reg.register_with_unit(
            "upload_duration",
            "Time from opening an upload until the server responds",
            Unit::Seconds,
            upload_duration.clone(),
        );

        let streams_opened = Counter::default();
        reg.register(
            "directive_streams",
            "Directive streams requested",
            streams_opened.clone(),
        );

        let streams_ended = Family::<CodeLabels, Counter>::default();
        reg.register(
            "directive_streams_ended",
            "Directive streams that failed to open or ended, by status",
            streams_ended.clone(),
        );

        let directives = Counter::default();
        reg.register(
            "directives_received",
            "Directives read from directive streams",
            directives.clone(),
        );

        Self {
            uploads,
            upload_chunks,
            upload_duration,
            streams_opened,
            streams_ended,
            directives,
        }
    }

    /// Starts timing an upload of `chunks` messages.
    pub(crate) fn upload(&self, rpc: Upload, chunks: usize) -> UploadTimer {
        self.upload_chunks
            .get_or_create(&RpcLabels { rpc: rpc.as_str() })
            .observe(chunks as f64);
        UploadTimer {
            metrics: self.clone(),
            rpc,
            start: Some(time::Instant::now()),
        }
    }

    pub(crate) fn stream_opened(&self) {
        self.streams_opened.inc();
    }

    pub(crate) fn stream_ended(&self, code: Code) {
        self.streams_ended
            .get_or_create(&CodeLabels {
                grpc_code: code_label(code),
            })
            .inc();
    }

    pub(crate) fn directive_received(&self) {
        self.directives.inc();
    }
}

// === impl Upload ===

impl Upload {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Diagnostics => "diagnostics",
            Self::Metrics => "metrics",
            Self::CommandResult => "command_result",
        }
    }
}

// === impl UploadTimer ===

impl UploadTimer {
    pub(crate) fn finish<T>(mut self, res: &Result<T, Status>) {
        let code = match res {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };
        self.record(code);
    }

    fn record(&mut self, code: Code) {
        let Some(start) = self.start.take() else {
            return;
        };
        let rpc = self.rpc.as_str();
        self.metrics
            .upload_duration
            .get_or_create(&RpcLabels { rpc })
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .uploads
            .get_or_create(&UploadLabels {
                rpc,
                grpc_code: code_label(code),
            })
            .inc();
    }
}

impl Drop for UploadTimer {
    fn drop(&mut self) {
        self.record(Code::Cancelled);
    }
}

fn code_label(code: Code) -> String {
    format!("{code:?}")
}

use crate::{
    client::DirectorClient,
    metrics::{DirectorMetrics, Upload},
    proto,
};
use futures::prelude::*;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tonic::{metadata::MetadataMap, transport::Channel, Code, Request, Status};

pub type DirectiveStream = Pin<Box<dyn Stream<Item = Result<proto::Directive, Status>> + Send>>;

/// The RPC surface of the control plane.
#[async_trait::async_trait]
pub trait Director: Send + Sync + 'static {
    async fn retrieve(&self, identity: proto::Identity) -> Result<DirectiveStream, Status>;

    async fn report_stream(&self, chunks: Vec<proto::RawSnapshotChunk>) -> Result<(), Status>;

    async fn stream_diagnostics(
        &self,
        chunks: Vec<proto::RawDiagnosticsChunk>,
    ) -> Result<(), Status>;

    async fn stream_metrics(&self, message: proto::StreamMetricsMessage) -> Result<(), Status>;

    async fn report_command_result(&self, result: proto::CommandResult) -> Result<(), Status>;
}

/// A [`Director`] backed by a tonic channel.
#[derive(Clone, Debug)]
pub struct GrpcDirector {
    client: DirectorClient,
    metadata: MetadataMap,
    metrics: DirectorMetrics,
}

#[allow(dead_code)]
const SVC: &str = "agent.Director";

// === impl GrpcDirector ===

impl GrpcDirector {
    pub fn new(channel: Channel, metadata: MetadataMap, metrics: DirectorMetrics) -> Self {
        Self {
            client: DirectorClient::new(channel),
            metadata,
            metrics,
        }
    }

    fn request<T>(&self, msg: T) -> Request<T> {
        let mut req = Request::new(msg);
        *req.metadata_mut() = self.metadata.clone();
        req
    }
}

#[async_trait::async_trait]
impl Director for GrpcDirector {
    async fn retrieve(&self, identity: proto::Identity) -> Result<DirectiveStream, Status> {
        self.metrics.stream_opened();
        match self.client.clone().retrieve(self.request(identity)).await {
            Ok(rsp) => Ok(Box::pin(ObservedStream {
                inner: Box::pin(rsp.into_inner()),
                metrics: self.metrics.clone(),
                ended: false,
            })),
            Err(status) => {
                self.metrics.stream_ended(status.code());
                Err(status)
            }
        }
    }

    async fn report_stream(&self, chunks: Vec<proto::RawSnapshotChunk>) -> Result<(), Status> {
        let timer = self.metrics.upload(Upload::Report, chunks.len());
        let res = self
            .client
            .clone()
            .report_stream(self.request(stream::iter(chunks)))
            .await
            .map(|_| ());
        timer.finish(&res);
        res
    }

    async fn stream_diagnostics(
        &self,
        chunks: Vec<proto::RawDiagnosticsChunk>,
    ) -> Result<(), Status> {
        let timer = self.metrics.upload(Upload::Diagnostics, chunks.len());
        let res = self
            .client
            .clone()
            .stream_diagnostics(self.request(stream::iter(chunks)))
            .await
            .map(|_| ());
        timer.finish(&res);
        res
    }

    async fn stream_metrics(&self, message: proto::StreamMetricsMessage) -> Result<(), Status> {
        let timer = self.metrics.upload(Upload::Metrics, 1);
        let res = self
            .client
            .clone()
            .stream_metrics(self.request(stream::iter(Some(message))))
            .await
            .map(|_| ());
        timer.finish(&res);
        res
    }

    async fn report_command_result(&self, result: proto::CommandResult) -> Result<(), Status> {
        let timer = self.metrics.upload(Upload::CommandResult, 1);
        let res = self
            .client
            .clone()
            .report_command_result(self.request(result))
            .await
            .map(|_| ());
        timer.finish(&res);
        res
    }
}

/// Counts the directives a stream delivers and records how it ends.
///
/// A stream dropped before the server ends it counts as cancelled.
struct ObservedStream {
    inner: DirectiveStream,
    metrics: DirectorMetrics,
    ended: bool,
}

// === impl ObservedStream ===

impl ObservedStream {
    fn end(&mut self, code: Code) {
        if !std::mem::replace(&mut self.ended, true) {
            self.metrics.stream_ended(code);
        }
    }
}

impl Stream for ObservedStream {
    type Item = Result<proto::Directive, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.poll_next_unpin(cx);
        match &poll {
            Poll::Ready(Some(Ok(_))) => self.metrics.directive_received(),
            Poll::Ready(Some(Err(status))) => self.end(status.code()),
            Poll::Ready(None) => self.end(Code::Ok),
            Poll::Pending => {}
        }
        poll
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        self.end(Code::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::{encoding::text::encode, registry::Registry};

    fn observed(
        items: Vec<Result<proto::Directive, Status>>,
    ) -> (ObservedStream, Registry) {
        let mut reg = Registry::default();
        let metrics = DirectorMetrics::register(&mut reg);
        let stream = ObservedStream {
            inner: Box::pin(stream::iter(items)),
            metrics,
            ended: false,
        };
        (stream, reg)
    }

    fn render(reg: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, reg).unwrap();
        out
    }

    #[tokio::test]
    async fn streams_count_directives_and_end_once() {
        let (mut stream, reg) = observed(vec![
            Ok(proto::Directive::default()),
            Ok(proto::Directive::default()),
            Err(Status::unavailable("gone")),
        ]);
        while stream.next().await.is_some() {}
        drop(stream);

        let out = render(&reg);
        assert!(out.contains("directives_received_total 2"), "{out}");
        assert!(
            out.contains("directive_streams_ended_total{grpc_code=\"Unavailable\"} 1"),
            "{out}"
        );
        assert!(!out.contains("grpc_code=\"Cancelled\""), "{out}");
    }

    #[test]
    fn dropped_streams_are_cancelled() {
        let (stream, reg) = observed(vec![Ok(proto::Directive::default())]);
        drop(stream);
        let out = render(&reg);
        assert!(
            out.contains("directive_streams_ended_total{grpc_code=\"Cancelled\"} 1"),
            "{out}"
        );
    }
}

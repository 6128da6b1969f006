//! A tonic client for the `agent.Director` service.

use crate::proto;
use tonic::{
    client::Grpc,
    codec::{ProstCodec, Streaming},
    codegen::{http::uri::PathAndQuery, GrpcMethod},
    transport::Channel,
    IntoRequest, IntoStreamingRequest, Response, Status,
};

const SERVICE: &str = "agent.Director";

#[derive(Clone, Debug)]
pub struct DirectorClient {
    inner: Grpc<Channel>,
}

impl DirectorClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {e}")))
    }

    pub async fn report_stream(
        &mut self,
        request: impl IntoStreamingRequest<Message = proto::RawSnapshotChunk>,
    ) -> Result<Response<proto::SnapshotResponse>, Status> {
        self.ready().await?;
        let mut req = request.into_streaming_request();
        req.extensions_mut()
            .insert(GrpcMethod::new(SERVICE, "ReportStream"));
        self.inner
            .client_streaming(
                req,
                PathAndQuery::from_static("/agent.Director/ReportStream"),
                ProstCodec::default(),
            )
            .await
    }

    pub async fn stream_diagnostics(
        &mut self,
        request: impl IntoStreamingRequest<Message = proto::RawDiagnosticsChunk>,
    ) -> Result<Response<proto::DiagnosticsResponse>, Status> {
        self.ready().await?;
        let mut req = request.into_streaming_request();
        req.extensions_mut()
            .insert(GrpcMethod::new(SERVICE, "StreamDiagnostics"));
        self.inner
            .client_streaming(
                req,
                PathAndQuery::from_static("/agent.Director/StreamDiagnostics"),
                ProstCodec::default(),
            )
            .await
    }

    pub async fn stream_metrics(
        &mut self,
        request: impl IntoStreamingRequest<Message = proto::StreamMetricsMessage>,
    ) -> Result<Response<proto::StreamMetricsResponse>, Status> {
        self.ready().await?;
        let mut req = request.into_streaming_request();
        req.extensions_mut()
            .insert(GrpcMethod::new(SERVICE, "StreamMetrics"));
        self.inner
            .client_streaming(
                req,
                PathAndQuery::from_static("/agent.Director/StreamMetrics"),
                ProstCodec::default(),
            )
            .await
    }

    pub async fn retrieve(
        &mut self,
        request: impl IntoRequest<proto::Identity>,
    ) -> Result<Response<Streaming<proto::Directive>>, Status> {
        self.ready().await?;
        let mut req = request.into_request();
        req.extensions_mut()
            .insert(GrpcMethod::new(SERVICE, "Retrieve"));
        self.inner
            .server_streaming(
                req,
                PathAndQuery::from_static("/agent.Director/Retrieve"),
                ProstCodec::default(),
            )
            .await
    }

    pub async fn report_command_result(
        &mut self,
        request: impl IntoRequest<proto::CommandResult>,
    ) -> Result<Response<proto::CommandResultResponse>, Status> {
        self.ready().await?;
        let mut req = request.into_request();
        req.extensions_mut()
            .insert(GrpcMethod::new(SERVICE, "ReportCommandResult"));
        self.inner
            .unary(
                req,
                PathAndQuery::from_static("/agent.Director/ReportCommandResult"),
                ProstCodec::default(),
            )
            .await
    }
}

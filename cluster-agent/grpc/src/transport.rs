use crate::{
    chunk, convert,
    director::{Director, DirectiveStream},
    proto,
};
use cluster_agent_core::{CommandResult, Diagnostics, Directive, Identity, Report};
use futures::prelude::*;
use prost::Message;
use std::{future::Future, sync::Arc};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, info_span, warn, Instrument};

/// A long-lived session with the control plane.
///
/// Reports, diagnostics, metrics and command results are sent on demand. Directives are pulled by a
/// background retriever task and delivered on the channel passed to [`Transport::spawn`].
pub struct Transport {
    director: Arc<dyn Director>,
    identity: Identity,
    wake: Arc<Notify>,
    metrics: Mutex<()>,
    cancel: CancellationToken,
}

// === impl Transport ===

impl Transport {
    /// Starts a session for `identity`, spawning its directive retriever.
    ///
    /// The session is cancelled along with `parent`, or explicitly via [`Transport::close`].
    pub fn spawn(
        director: Arc<dyn Director>,
        identity: Identity,
        directives: mpsc::Sender<Directive>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let wake = Arc::new(Notify::new());

        tokio::spawn(
            retrieve(
                director.clone(),
                convert::identity(&identity),
                directives,
                wake.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("retriever", cluster_id = %identity.cluster_id)),
        );

        Self {
            director,
            identity,
            wake,
            metrics: Mutex::new(()),
            cancel,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Uploads a report as a chunked client stream.
    ///
    /// Every attempt wakes the retriever, so a retriever sleeping after an error reconnects
    /// promptly.
    pub async fn report(&self, report: &Report) -> Result<(), Status> {
        self.wake.notify_one();

        let payload = convert::snapshot(report).encode_to_vec();
        let chunks = chunk::snapshot_chunks(&payload);
        debug!(bytes = payload.len(), chunks = chunks.len(), "Sending report");
        self.cancelable(self.director.report_stream(chunks)).await
    }

    pub async fn report_command_result(&self, result: &CommandResult) -> Result<(), Status> {
        self.cancelable(
            self.director
                .report_command_result(convert::command_result(result)),
        )
        .await
    }

    /// Sends a single metrics batch on its own stream.
    ///
    /// Concurrent callers are serialized so batches never interleave.
    pub async fn stream_metrics(&self, families: Vec<proto::MetricFamily>) -> Result<(), Status> {
        let _guard = self.metrics.lock().await;
        let message = proto::StreamMetricsMessage {
            identity: Some(convert::identity(&self.identity)),
            families,
        };
        self.cancelable(self.director.stream_metrics(message)).await
    }

    pub async fn stream_diagnostics(&self, diagnostics: &Diagnostics) -> Result<(), Status> {
        let payload = convert::diagnostics(diagnostics).encode_to_vec();
        let chunks = chunk::diagnostics_chunks(&payload);
        debug!(bytes = payload.len(), chunks = chunks.len(), "Sending diagnostics");
        self.cancelable(self.director.stream_diagnostics(chunks))
            .await
    }

    /// Stops the retriever and aborts in-flight calls.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn cancelable<F>(&self, call: F) -> Result<(), Status>
    where
        F: Future<Output = Result<(), Status>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("transport closed"));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Status::cancelled("transport closed")),
            res = call => res,
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pulls directives until cancelled, reopening the stream each time the wake signal fires after a
/// failure.
async fn retrieve(
    director: Arc<dyn Director>,
    identity: proto::Identity,
    directives: mpsc::Sender<Directive>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            res = director.retrieve(identity.clone()) => res,
        };

        match opened {
            Ok(stream) => {
                info!("Directive stream open");
                match recv_directives(stream, &directives, &cancel).await {
                    Ok(()) => info!("Directive stream closed by server"),
                    Err(Closed) => return,
                }
            }
            Err(status) => warn!(code = ?status.code(), message = %status.message(), "Failed to open directive stream"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = wake.notified() => debug!("Woken"),
        }
    }
}

/// The retriever should exit: either the session was cancelled or nobody is listening.
struct Closed;

async fn recv_directives(
    mut stream: DirectiveStream,
    directives: &mpsc::Sender<Directive>,
    cancel: &CancellationToken,
) -> Result<(), Closed> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Err(Closed),
            msg = stream.next() => msg,
        };
        match msg {
            None => return Ok(()),
            Some(Err(status)) => {
                warn!(code = ?status.code(), message = %status.message(), "Directive stream failed");
                return Ok(());
            }
            Some(Ok(msg)) => {
                let directive = convert::directive(msg);
                debug!(directive.id = %directive.id, commands = directive.commands.len(), "Received directive");
                if directives.send(directive).await.is_err() {
                    return Err(Closed);
                }
            }
        }
    }
}

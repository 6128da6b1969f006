//! Serves health probes and metrics.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming, header, server::conn::http1, service::service_fn, Method, Request, Response,
    StatusCode,
};
use hyper_util::rt::TokioIo;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone)]
pub struct Admin {
    ready: watch::Receiver<bool>,
    live: CancellationToken,
    registry: Arc<Registry>,
}

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

// === impl Admin ===

impl Admin {
    /// Probes report live until `live` is cancelled.
    pub fn new(ready: watch::Receiver<bool>, live: CancellationToken, registry: Registry) -> Self {
        Self {
            ready,
            live,
            registry: Arc::new(registry),
        }
    }

    /// Serves connections on `listener` until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "HTTP admin server listening");
        }
        loop {
            let (stream, client) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                accept = listener.accept() => match accept {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let admin = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(
                async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let rsp = admin.handle(req.method(), req.uri().path());
                        async move { Ok::<_, Infallible>(rsp) }
                    });
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
                    tokio::pin!(conn);
                    tokio::select! {
                        res = conn.as_mut() => if let Err(error) = res {
                            debug!(%error, "Connection closed");
                        },
                        _ = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.as_mut().await;
                        }
                    }
                }
                .instrument(info_span!("conn", %client)),
            );
        }
    }

    pub(crate) fn handle(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if !matches!(*method, Method::GET | Method::HEAD) {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "", None);
        }
        match path {
            "/probes/ready" => {
                if *self.ready.borrow() {
                    respond(StatusCode::OK, "ready\n", Some("text/plain"))
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "not ready\n", Some("text/plain"))
                }
            }
            "/probes/live" => {
                if self.live.is_cancelled() {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "not alive\n", Some("text/plain"))
                } else {
                    respond(StatusCode::OK, "alive\n", Some("text/plain"))
                }
            }
            "/metrics" => {
                let mut body = String::new();
                match encode(&mut body, &self.registry) {
                    Ok(()) => respond(StatusCode::OK, body, Some(OPENMETRICS)),
                    Err(error) => {
                        warn!(%error, "Failed to encode metrics");
                        respond(StatusCode::INTERNAL_SERVER_ERROR, "", None)
                    }
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "", None),
        }
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin")
            .field("ready", &*self.ready.borrow())
            .field("live", &!self.live.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn respond(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: Option<&'static str>,
) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(body.into()));
    *rsp.status_mut() = status;
    if let Some(ct) = content_type {
        rsp.headers_mut()
            .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(ct));
    }
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use prometheus_client::metrics::counter::Counter;

    fn admin() -> (Admin, watch::Sender<bool>, CancellationToken) {
        let mut registry = Registry::with_prefix("agent");
        let counter = Counter::<u64>::default();
        registry.register("directives", "Directives received", counter.clone());
        counter.inc();

        let (ready_tx, ready_rx) = watch::channel(false);
        let live = CancellationToken::new();
        (Admin::new(ready_rx, live.clone(), registry), ready_tx, live)
    }

    async fn body(rsp: Response<Full<Bytes>>) -> String {
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let (admin, ready, _live) = admin();
        let rsp = admin.handle(&Method::GET, "/probes/ready");
        assert_eq!(rsp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(rsp).await, "not ready\n");

        ready.send(true).unwrap();
        let rsp = admin.handle(&Method::HEAD, "/probes/ready");
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(body(rsp).await, "ready\n");
    }

    #[tokio::test]
    async fn liveness_ends_with_the_root_token() {
        let (admin, _ready, live) = admin();
        let rsp = admin.handle(&Method::GET, "/probes/live");
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(body(rsp).await, "alive\n");

        live.cancel();
        assert_eq!(
            admin.handle(&Method::GET, "/probes/live").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn renders_metrics() {
        let (admin, _ready, _live) = admin();
        let rsp = admin.handle(&Method::GET, "/metrics");
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.headers()[header::CONTENT_TYPE], OPENMETRICS);
        let text = body(rsp).await;
        assert!(text.contains("agent_directives_total 1"), "{text}");
    }

    #[test]
    fn rejects_other_paths_and_methods() {
        let (admin, _ready, _live) = admin();
        assert_eq!(
            admin.handle(&Method::GET, "/ready").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            admin.handle(&Method::POST, "/probes/ready").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}

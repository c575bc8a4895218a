//! Prometheus scrape endpoint.
//!
//! Serves `GET /metrics` from the injected registry; every other path is a 404.

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const METRICS_PATH: &str = "/metrics";

/// Binds the scrape listener on all interfaces. Failure here is a startup error.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))
}

/// Accepts scrape connections until `cancel_token` fires.
pub async fn serve_metrics(
    listener: TcpListener,
    registry: Registry,
    cancel_token: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(
            "Prometheus metrics server listening on http://{}{}",
            addr, METRICS_PATH
        );
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                let registry = registry.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let registry = registry.clone();
                        async move { Ok::<_, Infallible>(respond(&req, &registry)) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}

fn respond<B>(req: &Request<B>, registry: &Registry) -> Response<Full<Bytes>> {
    if req.uri().path() != METRICS_PATH {
        return with_status(StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found"));
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        return with_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::from(format!("failed to encode metrics: {err}")),
        );
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(prometheus::TEXT_FORMAT),
    );
    response
}

fn with_status(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

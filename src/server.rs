//! Bundled HTTP transport: one axum listener per HTTP service.

use crate::engine::MockEngine;
use crate::http::{HttpOutcome, HttpService, MockRequest, MockResponse};
use crate::performance::Fault;
use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Not copied between the inbound request and the forwarded one.
const HOP_BY_HOP: &[&str] = &["host", "connection", "content-length", "transfer-encoding"];

#[derive(Clone)]
struct ServiceState {
    service: Arc<HttpService>,
    client: reqwest::Client,
}

/// Listeners bound for every HTTP service of an engine.
pub struct MockServer {
    listeners: Vec<(TcpListener, Arc<HttpService>)>,
    client: reqwest::Client,
}

impl MockServer {
    /// Bind every HTTP service, on `bind` instead of its hostname when given.
    pub async fn bind(engine: &MockEngine, bind: Option<&str>) -> anyhow::Result<Self> {
        let mut listeners = Vec::new();
        for service in engine.http_services() {
            let config = service.config();
            if config.ssl {
                anyhow::bail!(
                    "HTTP service {}: TLS termination is not supported by the bundled server",
                    service.name()
                );
            }
            let host = bind.unwrap_or(config.hostname.as_str());
            let listener = TcpListener::bind((host, config.port))
                .await
                .with_context(|| format!("failed to bind {}:{}", host, config.port))?;
            info!(
                service = %service.name(),
                address = %listener.local_addr()?,
                "HTTP service listening"
            );
            listeners.push((listener, service.clone()));
        }
        Ok(Self {
            listeners,
            client: reqwest::Client::new(),
        })
    }

    /// Bound addresses, in service declaration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for (listener, service) in self.listeners {
            let app = router(service, self.client.clone());
            let mut stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = stop_rx.wait_for(|stop| *stop).await;
                    })
                    .await
            }));
        }

        shutdown.await;
        stop_tx.send_replace(true);
        for task in tasks {
            task.await??;
        }
        info!("HTTP services stopped");
        Ok(())
    }
}

/// Router answering every path and method from one service.
pub fn router(service: Arc<HttpService>, client: reqwest::Client) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(ServiceState { service, client })
}

async fn handle(State(state): State<ServiceState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
        }
    };
    let request = mock_request(&parts, body);

    match state.service.handle(&request).await {
        HttpOutcome::Respond(response) => into_response(response),
        HttpOutcome::Forward { target } => forward(&state.client, &request, &target).await,
        HttpOutcome::Abort(fault) => abort(fault),
    }
}

fn mock_request(parts: &Parts, body: Bytes) -> MockRequest {
    let mut request =
        MockRequest::new(parts.method.as_str(), parts.uri.path()).with_body(body.to_vec());
    request.query = parts.uri.query().map(String::from);
    for (name, value) in &parts.headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match request.headers.get_mut(name.as_str()) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                request.headers.insert(name.as_str().to_string(), value);
            }
        }
    }
    request
}

fn into_response(response: MockResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        warn!(error = %e, "Invalid mocked response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

async fn forward(client: &reqwest::Client, request: &MockRequest, target: &str) -> Response {
    match try_forward(client, request, target).await {
        Ok(response) => into_response(response),
        Err(e) => {
            warn!(upstream = %target, error = %e, "Fallback forwarding failed");
            into_response(MockResponse::error(
                502,
                "fallback_failed",
                &format!("Upstream request failed: {}", e),
            ))
        }
    }
}

async fn try_forward(
    client: &reqwest::Client,
    request: &MockRequest,
    target: &str,
) -> anyhow::Result<MockResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
    let mut outbound = client.request(method, target).body(request.body.clone());
    for (name, value) in &request.headers {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            outbound = outbound.header(name.as_str(), value.as_str());
        }
    }

    let upstream = outbound.send().await?;
    let status = upstream.status().as_u16();
    let headers = upstream
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let body = upstream.bytes().await?.to_vec();
    Ok(MockResponse {
        status,
        headers,
        body,
    })
}

/// A response whose body fails on first poll, so the connection is torn down.
fn abort(fault: Fault) -> Response {
    let kind = match fault {
        Fault::ConnectionClosed => std::io::ErrorKind::UnexpectedEof,
        _ => std::io::ErrorKind::ConnectionReset,
    };
    let stream = futures_util::stream::once(async move {
        Err::<Bytes, _>(std::io::Error::new(kind, format!("injected fault {}", fault)))
    });
    Response::new(Body::from_stream(stream))
}

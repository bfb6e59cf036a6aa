//! Host proxy (C9): an axum server that terminates inbound HTTP(S),
//! drives the engine's `on_request`/`on_response` callbacks, and
//! forwards whatever the engine didn't short-circuit to the upstream via
//! `reqwest`.
//!
//! Grounded on `mitigation-node/src/management.rs`'s axum router/state
//! idiom (`State<T>` extractor, `#[instrument(skip(..))]` handlers) and
//! on its `ShutdownSignal` for graceful termination; the upstream call
//! itself follows the same request/forward/respond shape as
//! `tcp_proxy.rs`'s `handle_connection`, generalized from raw bytes to
//! parsed HTTP.

use crate::engine::Engine;
use crate::error::MockError;
use crate::flow::{Flow, OrderedMultiMap, Request as MockRequest, Response as MockResponse};
use axum::body::Body;
use axum::extract::{Request as AxumRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Shared shutdown signal: set once a rule's `terminate` key fires, the
/// serve loop observes it and stops accepting new connections after the
/// grace period.
#[derive(Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    async fn wait(&self) {
        while !self.is_requested() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct ProxyState {
    engine: Arc<Engine>,
    upstream: String,
    http_client: reqwest::Client,
    shutdown: ShutdownSignal,
}

/// Runs the proxy server on `listen_addr`, forwarding unmocked traffic to
/// `upstream` (e.g. `http://localhost:8080`), until the shutdown signal
/// fires or a Ctrl-C is received.
pub async fn serve(
    listen_addr: SocketAddr,
    upstream: String,
    engine: Arc<Engine>,
    shutdown: ShutdownSignal,
) -> crate::error::Result<()> {
    let state = ProxyState {
        engine,
        upstream,
        http_client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| MockError::Upstream(e.to_string()))?,
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .fallback(any(handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(MockError::Io)?;
    info!(listen_addr = %listen_addr, "mock proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
            info!("shutdown requested by a rule, draining connections");
        })
        .await
        .map_err(|e| MockError::Other(e.to_string()))?;

    Ok(())
}

#[instrument(skip(state, request), fields(method = %request.method(), path = %request.uri().path()))]
async fn handle(State(state): State<ProxyState>, request: AxumRequest) -> AxumResponse {
    match handle_inner(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            state.engine.on_error("proxy", &err).await;
            error!(error = %err, "request handling failed");
            (StatusCode::BAD_GATEWAY, "mock proxy error").into_response()
        }
    }
}

async fn handle_inner(state: &ProxyState, request: AxumRequest) -> crate::error::Result<AxumResponse> {
    let mock_request = to_mock_request(request).await?;
    let mut flow = Flow::new(mock_request);

    let should_terminate = state.engine.on_request(&mut flow).await?;

    if flow.response.is_none() {
        let upstream_response = forward_upstream(state, &flow.request).await;
        match upstream_response {
            Ok(response) => flow.response = Some(response),
            Err(err) => {
                state.engine.on_error("upstream", &err).await;
                return Ok((StatusCode::BAD_GATEWAY, "upstream request failed").into_response());
            }
        }
    }
    state.engine.on_response(&mut flow).await?;

    if should_terminate || flow.should_terminate {
        state.shutdown.request();
    }

    let response = flow.response.expect("response set by mock or upstream forward");
    Ok(from_mock_response(response))
}

async fn to_mock_request(request: AxumRequest) -> crate::error::Result<MockRequest> {
    let method = request.method().to_string();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let scheme = uri.scheme_str().unwrap_or("http").to_string();
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_else(|| uri.host().unwrap_or("localhost"))
        .to_string();
    let path = uri.path().to_string();
    let query = uri.query().map(OrderedMultiMap::from_query_str).unwrap_or_default();

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| MockError::Other(e.to_string()))?;

    Ok(MockRequest {
        scheme,
        host,
        method,
        path,
        query,
        headers,
        body,
    })
}

async fn forward_upstream(state: &ProxyState, request: &MockRequest) -> crate::error::Result<MockResponse> {
    let url = format!("{}{}", state.upstream.trim_end_matches('/'), request.path_with_query());
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| MockError::Upstream(e.to_string()))?;

    let mut builder = state.http_client.request(method, &url);
    for (name, value) in request.headers.iter() {
        if *name == axum::http::header::HOST {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    builder = builder.body(request.body.clone());

    let upstream_response = builder
        .send()
        .await
        .map_err(|e| MockError::Upstream(e.to_string()))?;

    let status = upstream_response.status().as_u16();
    let headers = upstream_response.headers().clone();
    let body = upstream_response
        .bytes()
        .await
        .map_err(|e| MockError::Upstream(e.to_string()))?;

    Ok(MockResponse { status, headers, body })
}

fn from_mock_response(response: MockResponse) -> AxumResponse {
    let mut builder = axum::http::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response())
}

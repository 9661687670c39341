//! HTTP front door.
//!
//! # Responsibilities
//! - Create the Axum router: `POST /` for JSON-RPC, `GET /health`
//! - Wire up middleware (request ID, tracing)
//! - Turn each POST into a RequestContext and hand it to the dispatch engine
//! - Serve until shutdown, running the DNS refresher alongside

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::ACCEPT_ENCODING, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{PrimaryRole, ProxyConfig};
use crate::http::request::{request_id, ConnectionPreference, RpcEnvelope, X_REQUEST_ID};
use crate::http::response::{parse_error, payload_too_large};
use crate::observability::metrics;
use crate::proxy::{DispatchEngine, EngineError, RequestContext};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub max_body_bytes: usize,
}

/// HTTP server for the split proxy.
pub struct HttpServer {
    router: Router,
    engine: Arc<DispatchEngine>,
}

impl HttpServer {
    /// Create a server with its own dispatch engine.
    pub fn new(config: ProxyConfig) -> Result<Self, EngineError> {
        let engine = Arc::new(DispatchEngine::from_config(&config)?);
        Ok(Self::with_engine(&config, engine))
    }

    pub fn with_engine(config: &ProxyConfig, engine: Arc<DispatchEngine>) -> Self {
        let state = AppState {
            engine: engine.clone(),
            max_body_bytes: config.listener.max_body_bytes,
        };
        let router = Self::build_router(state);
        Self { router, engine }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let x_request_id = HeaderName::from_static(X_REQUEST_ID);
        Router::new()
            .route("/", post(rpc_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
    }

    pub fn engine(&self) -> Arc<DispatchEngine> {
        self.engine.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let roles = self.engine.roles();
        tracing::info!(
            address = %addr,
            stream_endpoint = %roles.stream(),
            compare_endpoint = %roles.compare(),
            "Split proxy listening"
        );

        tokio::spawn(self.engine.pool().clone().run(shutdown.resubscribe()));

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// JSON-RPC entry point.
async fn rpc_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);

    let raw = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Could not read request body");
            metrics::record_request(StatusCode::PAYLOAD_TOO_LARGE.as_u16(), Default::default());
            return payload_too_large();
        }
    };

    let envelope = match RpcEnvelope::parse(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Rejected malformed JSON body");
            metrics::record_request(StatusCode::BAD_REQUEST.as_u16(), Default::default());
            return parse_error();
        }
    };

    let ctx = RequestContext::new(request_id, envelope, raw, state.engine.request_timeout()).with_client_headers(
        parts.headers.get(ACCEPT_ENCODING).cloned(),
        ConnectionPreference::from_request(parts.version, &parts.headers),
    );
    let ctx = Arc::new(ctx);
    let id = ctx.id().clone();

    let (inbound, pending) = state.engine.open_inbound(&ctx);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.handle(ctx, inbound).await;
    });

    pending.into_response(id).await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    primary_endpoint: String,
    secondary_endpoint: String,
    primary_role: PrimaryRole,
    current_stream_endpoint: String,
    current_compare_endpoint: String,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let roles = state.engine.roles();
    Json(HealthReport {
        status: "ok",
        primary_endpoint: roles.primary().to_string(),
        secondary_endpoint: roles.secondary().to_string(),
        primary_role: roles.primary_role(),
        current_stream_endpoint: roles.stream().to_string(),
        current_compare_endpoint: roles.compare().to_string(),
    })
}

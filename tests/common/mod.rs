//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use futures_util::StreamExt;
use tokio::net::TcpListener;

use split_rpc_proxy::config::ProxyConfig;
use split_rpc_proxy::http::HttpServer;
use split_rpc_proxy::lifecycle::Shutdown;
use split_rpc_proxy::proxy::DispatchEngine;

/// What a mock upstream answers with.
#[derive(Clone)]
pub struct Script {
    pub status: StatusCode,
    pub chunks: Vec<Bytes>,
    /// Wait before sending the response head.
    pub head_delay: Duration,
    /// Wait before each body chunk.
    pub chunk_delay: Duration,
    pub content_encoding: Option<&'static str>,
}

impl Script {
    pub fn json(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            chunks: vec![Bytes::from(body.to_string())],
            head_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            content_encoding: None,
        }
    }

    pub fn chunked(chunks: Vec<Bytes>, chunk_delay: Duration) -> Self {
        Self {
            chunks,
            chunk_delay,
            ..Self::json("")
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }

    pub fn with_encoding(mut self, encoding: &'static str) -> Self {
        self.content_encoding = Some(encoding);
        self
    }

    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

/// A request as seen by a mock upstream.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request_id: Option<String>,
    pub accept_encoding: Option<String>,
    pub body: Bytes,
}

#[derive(Clone)]
struct MockState {
    script: Script,
    hits: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Recorded>>>,
}

/// A running mock JSON-RPC upstream.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub url: String,
    hits: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl MockUpstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Responses whose body was fully sent.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.seen.lock().unwrap().clone()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.requests().into_iter().filter_map(|r| r.request_id).collect()
    }
}

/// Start a mock upstream on an ephemeral port.
pub async fn start_upstream(script: Script) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = MockState {
        script,
        hits: Arc::new(AtomicUsize::new(0)),
        completed: Arc::new(AtomicUsize::new(0)),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let mock = MockUpstream {
        addr,
        url: format!("http://{}/", addr),
        hits: state.hits.clone(),
        completed: state.completed.clone(),
        seen: state.seen.clone(),
    };

    let app = Router::new().route("/", post(mock_handler)).with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    mock
}

async fn mock_handler(State(state): State<MockState>, headers: HeaderMap, body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
    state.seen.lock().unwrap().push(Recorded {
        request_id: header_str("x-request-id"),
        accept_encoding: header_str("accept-encoding"),
        body,
    });

    let script = state.script.clone();
    tokio::time::sleep(script.head_delay).await;

    let delay = script.chunk_delay;
    let total = script.chunks.len();
    let completed = state.completed.clone();
    let stream = futures_util::stream::iter(script.chunks.into_iter().enumerate()).then(move |(i, chunk)| {
        let completed = completed.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if i + 1 == total {
                completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<_, Infallible>(chunk)
        }
    });

    let mut response = Response::builder()
        .status(script.status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(encoding) = script.content_encoding {
        response = response.header(header::CONTENT_ENCODING, encoding);
    }
    response.body(Body::from_stream(stream)).unwrap()
}

/// A URL nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/", addr)
}

/// Proxy config pointing the stream role at `stream_url` and the compare
/// role at `compare_url`.
pub fn proxy_config(stream_url: &str, compare_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.endpoints.primary_url = stream_url.to_string();
    config.endpoints.secondary_url = compare_url.to_string();
    config.timeouts.request_ms = 5_000;
    config
}

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub url: String,
    pub engine: Arc<DispatchEngine>,
    pub shutdown: Shutdown,
}

/// Start the proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let engine = server.engine();
    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();

    tokio::spawn(async move {
        server.run(listener, stop).await.unwrap();
    });

    RunningProxy {
        addr,
        url: format!("http://{}/", addr),
        engine,
        shutdown,
    }
}

pub fn rpc_body(method: &str, id: u64) -> String {
    format!(r#"{{"jsonrpc":"2.0","method":"{}","params":[],"id":{}}}"#, method, id)
}

/// Poll until `check` passes or two seconds elapse.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

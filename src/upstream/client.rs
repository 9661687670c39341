//! Sending one JSON-RPC POST to an upstream endpoint.

use std::error::Error as _;

use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::upstream::connection::{ConnectionLease, LeaseGuard};
use crate::upstream::endpoint::Endpoint;
use crate::upstream::pool::PooledClient;

pub const X_REQUEST_ID: &str = "x-request-id";

/// How a leg consumes its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegMode {
    /// Client's `Accept-Encoding` forwarded as-is; body relayed raw.
    Streaming,
    /// Asks for gzip/deflate; body buffered and decoded.
    Buffered,
}

/// Headers carried from the inbound request to both legs.
#[derive(Debug, Clone, Copy)]
pub struct ForwardHeaders<'a> {
    pub request_id: &'a str,
    pub accept_encoding: Option<&'a HeaderValue>,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {endpoint} failed: {}", chain(.source))]
    Transport {
        endpoint: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("request to {endpoint} timed out after {elapsed_ms}ms")]
    Timeout { endpoint: String, elapsed_ms: u64 },

    #[error("reading body from {endpoint} failed: {source}")]
    Body {
        endpoint: String,
        #[source]
        source: axum::Error,
    },

    #[error("could not build request for {endpoint}: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: axum::http::Error,
    },
}

impl UpstreamError {
    pub fn endpoint(&self) -> &str {
        match self {
            UpstreamError::Transport { endpoint, .. }
            | UpstreamError::Timeout { endpoint, .. }
            | UpstreamError::Body { endpoint, .. }
            | UpstreamError::Request { endpoint, .. } => endpoint,
        }
    }

    /// Short label for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            UpstreamError::Transport { source, .. } if source.is_connect() => "connect",
            UpstreamError::Transport { .. } => "transport",
            UpstreamError::Timeout { .. } => "timeout",
            UpstreamError::Body { .. } => "body",
            UpstreamError::Request { .. } => "request",
        }
    }
}

/// hyper-util's error only says "client error"; the cause is further down.
fn chain(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Response body that keeps its connection leased until dropped.
pub struct UpstreamBody {
    stream: BodyDataStream,
    _lease: Option<LeaseGuard>,
}

impl UpstreamBody {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, axum::Error>> {
        self.stream.next().await
    }

    /// Read the remaining body into memory.
    pub async fn collect(mut self) -> Result<Bytes, axum::Error> {
        let mut buffered = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            buffered.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buffered))
    }
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn content_encoding(&self) -> Option<String> {
        self.headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }
}

/// POST `body` to `endpoint`. Any HTTP status is a response; only transport
/// failures and the deadline are errors.
pub async fn send(
    client: &PooledClient,
    endpoint: &Endpoint,
    body: Bytes,
    mode: LegMode,
    headers: ForwardHeaders<'_>,
    deadline: Instant,
) -> Result<UpstreamResponse, UpstreamError> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(endpoint.url().as_str())
        .header(CONTENT_TYPE, "application/json")
        .header(X_REQUEST_ID, headers.request_id);

    builder = match (mode, headers.accept_encoding) {
        (LegMode::Streaming, Some(accept)) => builder.header(ACCEPT_ENCODING, accept.clone()),
        (LegMode::Streaming, None) => builder,
        (LegMode::Buffered, _) => builder.header(ACCEPT_ENCODING, "gzip, deflate"),
    };

    let request = builder.body(Body::from(body)).map_err(|source| UpstreamError::Request {
        endpoint: endpoint.to_string(),
        source,
    })?;

    let started = Instant::now();
    let response = match timeout_at(deadline, client.http().request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(source)) => {
            return Err(UpstreamError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(UpstreamError::Timeout {
                endpoint: endpoint.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
    };

    let lease = response
        .extensions()
        .get::<ConnectionLease>()
        .map(ConnectionLease::acquire);
    let (parts, incoming) = response.into_parts();

    Ok(UpstreamResponse {
        status: parts.status,
        headers: parts.headers,
        body: UpstreamBody {
            stream: Body::new(incoming).into_data_stream(),
            _lease: lease,
        },
    })
}

//! Responses written by the proxy itself.
//!
//! # Responsibilities
//! - JSON-RPC error envelopes for requests the proxy answers directly
//! - Building the client response head from a relayed upstream head
//!
//! # Design Decisions
//! - Upstream status and headers are mirrored; only hop-by-hop and framing
//!   headers are dropped, and `Connection` follows the client's preference
//! - Framing is left to the server because the relayed body is streamed

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::response::Parts;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::request::ConnectionPreference;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    jsonrpc: &'static str,
    error: RpcError,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// A JSON-RPC 2.0 error response.
pub fn rpc_error(
    status: StatusCode,
    code: i64,
    message: impl Into<String>,
    data: Option<Value>,
    id: Value,
) -> Response<Body> {
    let envelope = ErrorEnvelope {
        jsonrpc: "2.0",
        error: RpcError {
            code,
            message: message.into(),
            data,
        },
        id,
    };
    (status, Json(envelope)).into_response()
}

pub fn parse_error() -> Response<Body> {
    rpc_error(StatusCode::BAD_REQUEST, PARSE_ERROR, "Parse error", None, Value::Null)
}

pub fn invalid_request(id: Value) -> Response<Body> {
    rpc_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request", None, id)
}

pub fn payload_too_large() -> Response<Body> {
    rpc_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        INVALID_REQUEST,
        "Request body too large",
        None,
        Value::Null,
    )
}

pub fn upstream_unavailable(id: Value, stream_endpoint: &str, compare_endpoint: &str, error: &str) -> Response<Body> {
    rpc_error(
        StatusCode::BAD_GATEWAY,
        INTERNAL_ERROR,
        "Internal error: unable to connect to upstream",
        Some(json!({
            "streamEndpoint": stream_endpoint,
            "compareEndpoint": compare_endpoint,
            "error": error,
        })),
        id,
    )
}

pub fn internal_error(id: Value) -> Response<Body> {
    rpc_error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, "Internal error", None, id)
}

pub fn request_timeout(id: Value) -> Response<Body> {
    rpc_error(StatusCode::GATEWAY_TIMEOUT, SERVER_ERROR, "Request timeout", None, id)
}

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

fn is_hop_by_hop(name: &HeaderName) -> bool {
    [
        header::CONNECTION,
        KEEP_ALIVE,
        PROXY_CONNECTION,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
        header::TE,
        header::TRAILER,
        header::UPGRADE,
    ]
    .contains(name)
}

/// Client response head mirroring an upstream response.
pub fn relay_head(status: StatusCode, upstream: &HeaderMap, connection: ConnectionPreference) -> Parts {
    let mut response = Response::new(());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    match connection {
        ConnectionPreference::Close => {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        ConnectionPreference::KeepAlive => {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        ConnectionPreference::Unspecified => {}
    }

    response.into_parts().0
}

//! Inbound request inspection.
//!
//! # Responsibilities
//! - Resolve the request ID (client-supplied `x-request-id` or generated)
//! - Parse the JSON-RPC envelope just far enough to route and compare
//! - Read the client's keep-alive preference
//!
//! # Design Decisions
//! - The raw body bytes are forwarded untouched; the parsed envelope is only
//!   used for the method, params and id
//! - Batch (array) bodies parse but carry no method, so they are rejected as
//!   invalid requests

use axum::http::header::CONNECTION;
use axum::http::{HeaderMap, Version};
use serde_json::Value;
use uuid::Uuid;

pub use crate::upstream::X_REQUEST_ID;

/// The request ID header value, or a fresh UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// The fields of a JSON-RPC request the proxy cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcEnvelope {
    pub method: Option<String>,
    pub params: Option<Value>,
    pub id: Value,
}

impl RpcEnvelope {
    /// Parse a request body. Only malformed JSON is an error; a well-formed
    /// body without a string `method` yields an envelope with `method: None`.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut object) = value else {
            return Self::default();
        };
        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => Some(method),
            _ => None,
        };
        Self {
            method,
            params: object.remove("params"),
            id: object.remove("id").unwrap_or(Value::Null),
        }
    }
}

/// What the client asked for regarding connection reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPreference {
    Close,
    KeepAlive,
    #[default]
    Unspecified,
}

impl ConnectionPreference {
    pub fn from_request(version: Version, headers: &HeaderMap) -> Self {
        let tokens = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase());

        for token in tokens {
            match token.as_str() {
                "close" => return ConnectionPreference::Close,
                "keep-alive" => return ConnectionPreference::KeepAlive,
                _ => {}
            }
        }

        // HTTP/1.0 closes unless asked otherwise.
        if version == Version::HTTP_10 {
            ConnectionPreference::Close
        } else {
            ConnectionPreference::Unspecified
        }
    }
}

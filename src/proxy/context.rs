//! Per-request state shared by both legs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::http::HeaderValue;
use serde_json::Value;
use tokio::time::Instant;

use crate::http::request::{ConnectionPreference, RpcEnvelope};

/// Client-side lifecycle flags, written by disconnect observers and read by
/// the relay. `closed` never goes back to false.
#[derive(Debug, Default)]
pub struct ClientState {
    closed: AtomicBool,
    reason: OnceLock<String>,
    completed: AtomicBool,
}

impl ClientState {
    /// Record that the client went away. Returns true for the first call.
    pub fn mark_closed(&self, reason: impl Into<String>) -> bool {
        let _ = self.reason.set(reason.into());
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// The whole response was handed to the client connection.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Everything known about one inbound JSON-RPC request.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    envelope: RpcEnvelope,
    raw_body: Bytes,
    accept_encoding: Option<HeaderValue>,
    connection: ConnectionPreference,
    received_at: SystemTime,
    started: Instant,
    deadline: Instant,
    client: Arc<ClientState>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, envelope: RpcEnvelope, raw_body: Bytes, timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            request_id: request_id.into(),
            envelope,
            raw_body,
            accept_encoding: None,
            connection: ConnectionPreference::Unspecified,
            received_at: SystemTime::now(),
            started,
            deadline: started + timeout,
            client: Arc::new(ClientState::default()),
        }
    }

    pub fn with_client_headers(mut self, accept_encoding: Option<HeaderValue>, connection: ConnectionPreference) -> Self {
        self.accept_encoding = accept_encoding;
        self.connection = connection;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> Option<&str> {
        self.envelope.method.as_deref()
    }

    pub fn params(&self) -> Option<&Value> {
        self.envelope.params.as_ref()
    }

    pub fn id(&self) -> &Value {
        &self.envelope.id
    }

    /// The request body exactly as the client sent it.
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn accept_encoding(&self) -> Option<&HeaderValue> {
        self.accept_encoding.as_ref()
    }

    pub fn connection(&self) -> ConnectionPreference {
        self.connection
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }
}

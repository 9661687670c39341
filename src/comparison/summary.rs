//! What each leg captured about its response.

use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::http::StatusCode;
use serde::Serialize;
use tokio::time::Instant;

use crate::upstream::decode_body;

/// Which leg produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Stream,
    Compare,
}

impl Leg {
    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Stream => "stream",
            Leg::Compare => "compare",
        }
    }
}

/// When a leg's upstream body ended, measured from request arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegTiming {
    pub latency: Duration,
    pub wall_latency: Duration,
}

impl LegTiming {
    /// Take the timestamp now.
    pub fn since(started: Instant, received_at: SystemTime) -> Self {
        let latency = started.elapsed();
        let wall_latency = SystemTime::now()
            .duration_since(received_at)
            .unwrap_or(latency);
        Self { latency, wall_latency }
    }
}

/// Everything the comparator needs from one leg.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub leg: Leg,
    /// URL of the endpoint that answered.
    pub endpoint: String,
    pub status: StatusCode,
    /// Bytes as received on the wire.
    pub raw_len: usize,
    /// Body after Content-Encoding decoding.
    pub body: Bytes,
    pub content_encoding: Option<String>,
    /// Monotonic time from request arrival to the end of this leg's body.
    pub latency: Duration,
    /// Same span on the wall clock.
    pub wall_latency: Duration,
    /// Time the client took to take the relayed body after upstream ended.
    /// Always zero for the compare leg.
    pub client_drain: Duration,
}

impl ResponseSummary {
    /// Build a summary from a fully captured body. `timing` is taken when the
    /// upstream body ended, so neither decoding nor a slow client shows up as
    /// upstream slowness.
    pub async fn capture(
        leg: Leg,
        endpoint: String,
        status: StatusCode,
        content_encoding: Option<String>,
        raw: Bytes,
        timing: LegTiming,
    ) -> Self {
        let raw_len = raw.len();

        let body = match decode_body(content_encoding.as_deref(), raw.clone()).await {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(
                    endpoint = leg.as_str(),
                    encoding = ?content_encoding,
                    error = %e,
                    "Could not decode captured body, comparing raw bytes"
                );
                raw
            }
        };

        Self {
            leg,
            endpoint,
            status,
            raw_len,
            body,
            content_encoding,
            latency: timing.latency,
            wall_latency: timing.wall_latency,
            client_drain: Duration::ZERO,
        }
    }

    /// Size used for comparison: the decoded body length.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

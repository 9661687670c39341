//! Threshold-based comparison of the two legs.

use axum::body::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::comparison::summary::ResponseSummary;
use crate::config::ComparisonConfig;
use crate::observability::metrics;

/// One way in which the legs disagreed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    StatusCode {
        stream: u16,
        compare: u16,
    },
    Size {
        stream_size: usize,
        compare_size: usize,
        difference: usize,
    },
    Latency {
        stream_latency_ms: u64,
        compare_latency_ms: u64,
        difference_ms: u64,
    },
}

impl Mismatch {
    pub fn kind(&self) -> &'static str {
        match self {
            Mismatch::StatusCode { .. } => "status_code",
            Mismatch::Size { .. } => "size",
            Mismatch::Latency { .. } => "latency",
        }
    }
}

/// Structured record emitted when at least one mismatch is found.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchReport {
    pub request_id: String,
    pub method: String,
    pub mismatches: Vec<Mismatch>,
    pub stream_endpoint: String,
    pub compare_endpoint: String,
    pub stream_latency_ms: u64,
    pub compare_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_response_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_response_data: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Match,
    Mismatch(MismatchReport),
}

/// Compares a stream leg against a compare leg.
#[derive(Debug, Clone)]
pub struct Comparator {
    latency_threshold_ms: u64,
    size_diff_threshold: usize,
    include_bodies: bool,
    enabled: bool,
}

impl Comparator {
    pub fn new(config: &ComparisonConfig) -> Self {
        Self {
            latency_threshold_ms: config.latency_threshold_ms,
            size_diff_threshold: config.size_diff_threshold,
            include_bodies: config.include_bodies,
            enabled: config.log_mismatches,
        }
    }

    /// Pure comparison. No logging, no metrics.
    pub fn compare(
        &self,
        request_id: &str,
        method: &str,
        stream: &ResponseSummary,
        compare: &ResponseSummary,
    ) -> Verdict {
        let mut mismatches = Vec::new();

        if stream.status != compare.status {
            mismatches.push(Mismatch::StatusCode {
                stream: stream.status.as_u16(),
                compare: compare.status.as_u16(),
            });
        }

        let difference = stream.size().abs_diff(compare.size());
        if difference > self.size_diff_threshold {
            mismatches.push(Mismatch::Size {
                stream_size: stream.size(),
                compare_size: compare.size(),
                difference,
            });
        }

        // Only a slower compare endpoint counts.
        let lag = compare.latency_ms().saturating_sub(stream.latency_ms());
        if lag > self.latency_threshold_ms {
            mismatches.push(Mismatch::Latency {
                stream_latency_ms: stream.latency_ms(),
                compare_latency_ms: compare.latency_ms(),
                difference_ms: lag,
            });
        }

        if mismatches.is_empty() {
            return Verdict::Match;
        }

        let attach_bodies = self.include_bodies
            && mismatches
                .iter()
                .any(|m| matches!(m, Mismatch::Size { .. } | Mismatch::StatusCode { .. }));

        Verdict::Mismatch(MismatchReport {
            request_id: request_id.to_string(),
            method: method.to_string(),
            mismatches,
            stream_endpoint: stream.endpoint.clone(),
            compare_endpoint: compare.endpoint.clone(),
            stream_latency_ms: stream.latency_ms(),
            compare_latency_ms: compare.latency_ms(),
            stream_response_data: attach_bodies.then(|| body_for_report(&stream.body)),
            compare_response_data: attach_bodies.then(|| body_for_report(&compare.body)),
        })
    }

    /// Compare, log the outcome and record metrics. Returns `None` when
    /// comparison is switched off.
    pub fn evaluate(
        &self,
        request_id: &str,
        method: &str,
        stream: &ResponseSummary,
        compare: &ResponseSummary,
    ) -> Option<Verdict> {
        if !self.enabled {
            return None;
        }

        let verdict = self.compare(request_id, method, stream, compare);
        match &verdict {
            Verdict::Match => {
                tracing::debug!(
                    request_id,
                    method,
                    stream_latency_ms = stream.latency_ms(),
                    compare_latency_ms = compare.latency_ms(),
                    stream_size = stream.size(),
                    compare_size = compare.size(),
                    "Responses match"
                );
                metrics::record_comparison("match");
            }
            Verdict::Mismatch(report) => {
                let rendered = serde_json::to_string(report).unwrap_or_default();
                tracing::warn!(
                    request_id,
                    method,
                    mismatch_count = report.mismatches.len(),
                    stream_endpoint = %report.stream_endpoint,
                    compare_endpoint = %report.compare_endpoint,
                    report = %rendered,
                    "Response mismatch detected"
                );
                metrics::record_comparison("mismatch");
                for mismatch in &report.mismatches {
                    metrics::record_mismatch(mismatch.kind());
                }
            }
        }
        Some(verdict)
    }
}

/// Parsed JSON when possible, raw text otherwise.
fn body_for_report(body: &Bytes) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

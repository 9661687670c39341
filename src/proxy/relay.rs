//! Stream leg: relays the stream endpoint's response to the client while
//! capturing it for comparison.
//!
//! # Responsibilities
//! - Mirror the upstream status and headers to the client
//! - Forward body chunks in order, byte for byte
//! - Keep reading upstream after the client disconnects so the capture is
//!   complete and the upstream connection stays reusable
//! - Classify client disconnects for logging
//!
//! # Design Decisions
//! - Every chunk is captured whether or not it could be written
//! - A write is skipped, never retried, once the client is not writable
//! - Upstream reads are bounded by the request deadline

use std::io;
use std::time::Duration;

use axum::body::Bytes;
use thiserror::Error;
use tokio::time::timeout_at;

use crate::comparison::{Leg, LegTiming, ResponseSummary};
use crate::http::response::relay_head;
use crate::observability::metrics;
use crate::proxy::context::RequestContext;
use crate::proxy::inbound::{ClientWriter, InboundConnection};
use crate::upstream::{send, Endpoint, ForwardHeaders, LegMode, PooledClient, UpstreamError};

#[derive(Debug, Error)]
pub enum RelayError {
    /// Nothing came back from the stream endpoint.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The upstream body failed after the response head was received.
    #[error("stream from {endpoint} interrupted after {received} bytes: {reason}")]
    Interrupted {
        endpoint: String,
        received: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct StreamingRelay {
    fast_disconnect: Option<Duration>,
}

impl StreamingRelay {
    /// `fast_disconnect`: disconnects on responses that finished within this
    /// long are logged as benign.
    pub fn new(fast_disconnect: Option<Duration>) -> Self {
        Self { fast_disconnect }
    }

    pub async fn relay(
        &self,
        ctx: &RequestContext,
        endpoint: &Endpoint,
        client: &PooledClient,
        inbound: &mut InboundConnection,
    ) -> Result<ResponseSummary, RelayError> {
        let headers = ForwardHeaders {
            request_id: ctx.request_id(),
            accept_encoding: ctx.accept_encoding(),
        };

        let upstream = match send(
            client,
            endpoint,
            ctx.raw_body().clone(),
            LegMode::Streaming,
            headers,
            ctx.deadline(),
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(
                    request_id = %ctx.request_id(),
                    endpoint = "stream",
                    url = %endpoint,
                    latency_ms = ctx.elapsed().as_millis() as u64,
                    error = %e,
                    "Stream request failed"
                );
                metrics::record_upstream_failure(Leg::Stream.as_str(), e.stage());
                return Err(e.into());
            }
        };

        tracing::info!(
            request_id = %ctx.request_id(),
            endpoint = "stream",
            status_code = upstream.status.as_u16(),
            latency_ms = ctx.elapsed().as_millis() as u64,
            "Stream response started"
        );

        let status = upstream.status;
        let content_encoding = upstream.content_encoding();
        let writer = inbound.start_body(relay_head(status, &upstream.headers, ctx.connection()));
        let mut body = upstream.body;
        let mut captured: Vec<u8> = Vec::new();

        loop {
            let next = match timeout_at(ctx.deadline(), body.next_chunk()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(self
                        .interrupted(ctx, endpoint, writer, captured.len(), "request timeout".into())
                        .await)
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    captured.extend_from_slice(&chunk);
                    if let Some(writer) = writer.as_ref().filter(|w| w.is_writable()) {
                        writer.write(chunk).await;
                    }
                }
                Some(Err(e)) => {
                    return Err(self
                        .interrupted(ctx, endpoint, writer, captured.len(), e.to_string())
                        .await)
                }
                None => break,
            }
        }
        let timing = LegTiming::since(ctx.started(), ctx.received_at());
        drop(body);

        let delivered = match writer {
            Some(writer) => writer.finish().await,
            None => false,
        };
        let client_drain = ctx.elapsed().saturating_sub(timing.latency);

        let mut summary = ResponseSummary::capture(
            Leg::Stream,
            endpoint.to_string(),
            status,
            content_encoding,
            Bytes::from(captured),
            timing,
        )
        .await;
        summary.client_drain = client_drain;

        tracing::info!(
            request_id = %ctx.request_id(),
            endpoint = "stream",
            total_time_ms = summary.latency_ms(),
            client_drain_ms = client_drain.as_millis() as u64,
            response_size = summary.raw_len,
            delivered,
            "Stream response completed"
        );
        metrics::record_leg(Leg::Stream.as_str(), status.as_u16(), summary.latency);

        if !delivered {
            self.report_disconnect(ctx);
        }
        Ok(summary)
    }

    async fn interrupted(
        &self,
        ctx: &RequestContext,
        endpoint: &Endpoint,
        writer: Option<ClientWriter>,
        received: usize,
        reason: String,
    ) -> RelayError {
        tracing::error!(
            request_id = %ctx.request_id(),
            endpoint = "stream",
            url = %endpoint,
            received,
            error = %reason,
            "Stream error"
        );
        metrics::record_upstream_failure(Leg::Stream.as_str(), "body");
        if let Some(writer) = writer {
            writer
                .abort(io::Error::new(io::ErrorKind::UnexpectedEof, reason.clone()))
                .await;
        }
        RelayError::Interrupted {
            endpoint: endpoint.to_string(),
            received,
            reason,
        }
    }

    /// Disconnects on responses that finished inside the fast window are
    /// benign; anything later, or any disconnect with the window disabled,
    /// is early.
    pub fn classify_disconnect(&self, elapsed: Duration) -> DisconnectKind {
        match self.fast_disconnect {
            Some(window) if elapsed < window => DisconnectKind::Fast,
            _ => DisconnectKind::Early,
        }
    }

    fn report_disconnect(&self, ctx: &RequestContext) {
        let elapsed = ctx.elapsed();
        let reason = ctx.client().close_reason().unwrap_or("unknown");
        let kind = self.classify_disconnect(elapsed);
        match kind {
            DisconnectKind::Fast => tracing::info!(
                request_id = %ctx.request_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                reason,
                "Client closed connection right after the response"
            ),
            DisconnectKind::Early => tracing::warn!(
                request_id = %ctx.request_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                reason,
                "Client disconnected before response completed"
            ),
        }
        metrics::record_client_disconnect(kind.as_str());
    }
}

/// How a client disconnect during relay is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Fast,
    Early,
}

impl DisconnectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectKind::Fast => "fast",
            DisconnectKind::Early => "early",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_inside_window_is_fast() {
        let relay = StreamingRelay::new(Some(Duration::from_millis(10)));
        assert_eq!(relay.classify_disconnect(Duration::from_millis(4)), DisconnectKind::Fast);
        assert_eq!(relay.classify_disconnect(Duration::from_millis(10)), DisconnectKind::Early);
        assert_eq!(relay.classify_disconnect(Duration::from_secs(2)), DisconnectKind::Early);
    }

    #[test]
    fn test_zero_window_reports_every_disconnect_as_early() {
        let relay = StreamingRelay::new(None);
        assert_eq!(relay.classify_disconnect(Duration::ZERO), DisconnectKind::Early);
        assert_eq!(DisconnectKind::Early.as_str(), "early");
    }
}

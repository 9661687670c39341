//! Dual dispatch: one request, two endpoints, one response.
//!
//! # Data Flow
//! ```text
//! RequestContext ─→ validate method
//!                 ─→ RoleController::snapshot()  (once)
//!                 ├─→ compare leg (spawned, buffered, skipped for excluded methods)
//!                 └─→ stream leg  (relay.rs, inline) ─→ client
//!                          ↓
//!                 reconcile (spawned): await compare leg → Comparator
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::comparison::{Comparator, Leg, LegTiming, ResponseSummary};
use crate::config::ProxyConfig;
use crate::http::response::{invalid_request, request_timeout, upstream_unavailable};
use crate::observability::metrics;
use crate::proxy::context::RequestContext;
use crate::proxy::inbound::{InboundConnection, PendingResponse};
use crate::proxy::relay::{RelayError, StreamingRelay};
use crate::proxy::roles::{RoleAssignment, RoleController};
use crate::upstream::{
    send, Endpoint, EndpointName, EndpointPool, ForwardHeaders, LegMode, PoolSettings, PooledClient,
    UpstreamError,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid {field} {value:?}: {source}")]
    InvalidEndpoint {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
}

type CompareLeg = JoinHandle<Result<ResponseSummary, UpstreamError>>;

pub struct DispatchEngine {
    roles: RoleController,
    pool: Arc<EndpointPool>,
    comparator: Arc<Comparator>,
    relay: StreamingRelay,
    excluded_methods: HashSet<String>,
    queue_depth: usize,
    request_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(config: &ProxyConfig, pool: Arc<EndpointPool>) -> Result<Self, EngineError> {
        let primary = Arc::new(Endpoint::new(
            EndpointName::Primary,
            parse_url("endpoints.primary_url", &config.endpoints.primary_url)?,
        ));
        let secondary = Arc::new(Endpoint::new(
            EndpointName::Secondary,
            parse_url("endpoints.secondary_url", &config.endpoints.secondary_url)?,
        ));

        // Create both clients up front so the refresher tracks them from the start.
        pool.get_client(primary.url());
        pool.get_client(secondary.url());

        let fast_disconnect = match config.relay.fast_disconnect_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            roles: RoleController::new(RoleAssignment::new(primary, secondary, config.endpoints.primary_role)),
            pool,
            comparator: Arc::new(Comparator::new(&config.comparison)),
            relay: StreamingRelay::new(fast_disconnect),
            excluded_methods: config.comparison.excluded_methods.iter().cloned().collect(),
            queue_depth: config.relay.write_queue_depth,
            request_timeout: Duration::from_millis(config.timeouts.request_ms),
        })
    }

    /// Engine with its own pool using the system resolver.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, EngineError> {
        let pool = Arc::new(EndpointPool::new(PoolSettings::from(config)));
        Self::new(config, pool)
    }

    pub fn roles(&self) -> Arc<RoleAssignment> {
        self.roles.snapshot()
    }

    pub fn stream_endpoint(&self) -> Arc<Endpoint> {
        self.roles.snapshot().stream().clone()
    }

    pub fn compare_endpoint(&self) -> Arc<Endpoint> {
        self.roles.snapshot().compare().clone()
    }

    /// Swap stream and compare endpoints for requests that arrive from now on.
    pub fn switch_roles(&self) -> Arc<RoleAssignment> {
        let next = self.roles.switch_roles();
        tracing::info!(
            stream_endpoint = %next.stream(),
            compare_endpoint = %next.compare(),
            primary_role = next.primary_role().as_str(),
            "Switched primary/secondary roles"
        );
        metrics::record_role_switch();
        next
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_excluded(&self, method: &str) -> bool {
        self.excluded_methods.contains(method)
    }

    pub fn open_inbound(&self, ctx: &RequestContext) -> (InboundConnection, PendingResponse) {
        InboundConnection::open(ctx, self.queue_depth)
    }

    /// Serve one request end to end. Keeps running after the client leaves
    /// so both legs complete.
    pub async fn handle(&self, ctx: Arc<RequestContext>, mut inbound: InboundConnection) {
        let Some(method) = ctx.method().map(str::to_owned) else {
            tracing::warn!(request_id = %ctx.request_id(), "Rejected request without a method");
            metrics::record_request(400, ctx.elapsed());
            inbound.respond(invalid_request(ctx.id().clone()));
            return;
        };

        tracing::info!(request_id = %ctx.request_id(), method = %method, "Received JSON-RPC request");
        let params = ctx.params().unwrap_or(&Value::Null);
        tracing::debug!(request_id = %ctx.request_id(), params = %params, "Request params");

        let roles = self.roles.snapshot();
        let compare_leg = if self.is_excluded(&method) {
            tracing::debug!(request_id = %ctx.request_id(), method = %method, "Method excluded from comparison");
            None
        } else {
            Some(self.spawn_compare_leg(&ctx, roles.compare().clone()))
        };

        let client = self.pool.get_client(roles.stream().url());
        let outcome = self.relay.relay(&ctx, roles.stream(), &client, &mut inbound).await;

        match outcome {
            Ok(stream) => {
                metrics::record_request(stream.status.as_u16(), ctx.elapsed());
                if let Some(compare_leg) = compare_leg {
                    let comparator = self.comparator.clone();
                    tokio::spawn(reconcile(comparator, ctx, method, stream, compare_leg));
                }
            }
            Err(RelayError::Upstream(UpstreamError::Timeout { .. })) => {
                // Same deadline as the front door's timer; whichever fires
                // first, the client sees a timeout.
                inbound.respond(request_timeout(ctx.id().clone()));
                metrics::record_request(504, ctx.elapsed());
                if let Some(compare_leg) = compare_leg {
                    tokio::spawn(discard_compare_leg(ctx, compare_leg));
                }
            }
            Err(RelayError::Upstream(e)) => {
                if !inbound.headers_sent() {
                    inbound.respond(upstream_unavailable(
                        ctx.id().clone(),
                        roles.stream().url().as_str(),
                        roles.compare().url().as_str(),
                        &e.to_string(),
                    ));
                }
                metrics::record_request(502, ctx.elapsed());
                if let Some(compare_leg) = compare_leg {
                    tokio::spawn(discard_compare_leg(ctx, compare_leg));
                }
            }
            Err(RelayError::Interrupted { .. }) => {
                // Headers are out; the client saw a truncated body.
                metrics::record_request(502, ctx.elapsed());
                if let Some(compare_leg) = compare_leg {
                    tokio::spawn(discard_compare_leg(ctx, compare_leg));
                }
            }
        }
    }

    fn spawn_compare_leg(&self, ctx: &Arc<RequestContext>, endpoint: Arc<Endpoint>) -> CompareLeg {
        let client = self.pool.get_client(endpoint.url());
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = fetch_compare(&client, &endpoint, &ctx).await;

            match &result {
                Ok(summary) => {
                    tracing::info!(
                        request_id = %ctx.request_id(),
                        endpoint = "compare",
                        status_code = summary.status.as_u16(),
                        latency_ms = summary.latency_ms(),
                        response_size = summary.size(),
                        "Compare response received"
                    );
                    metrics::record_leg(Leg::Compare.as_str(), summary.status.as_u16(), summary.latency);
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        endpoint = "compare",
                        url = %endpoint,
                        latency_ms = ctx.elapsed().as_millis() as u64,
                        error = %e,
                        "Compare request failed"
                    );
                    metrics::record_upstream_failure(Leg::Compare.as_str(), e.stage());
                }
            }
            result
        })
    }
}

async fn fetch_compare(
    client: &PooledClient,
    endpoint: &Endpoint,
    ctx: &RequestContext,
) -> Result<ResponseSummary, UpstreamError> {
    let headers = ForwardHeaders {
        request_id: ctx.request_id(),
        accept_encoding: None,
    };
    let response = send(
        client,
        endpoint,
        ctx.raw_body().clone(),
        LegMode::Buffered,
        headers,
        ctx.deadline(),
    )
    .await?;

    let status = response.status;
    let content_encoding = response.content_encoding();
    let raw = match tokio::time::timeout_at(ctx.deadline(), response.body.collect()).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(source)) => {
            return Err(UpstreamError::Body {
                endpoint: endpoint.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(UpstreamError::Timeout {
                endpoint: endpoint.to_string(),
                elapsed_ms: ctx.elapsed().as_millis() as u64,
            })
        }
    };
    let timing = LegTiming::since(ctx.started(), ctx.received_at());

    Ok(ResponseSummary::capture(Leg::Compare, endpoint.to_string(), status, content_encoding, raw, timing).await)
}

/// Wait for the compare leg and run the comparator.
async fn reconcile(
    comparator: Arc<Comparator>,
    ctx: Arc<RequestContext>,
    method: String,
    stream: ResponseSummary,
    compare_leg: CompareLeg,
) {
    match compare_leg.await {
        Ok(Ok(compare)) => {
            comparator.evaluate(ctx.request_id(), &method, &stream, &compare);
        }
        Ok(Err(_)) => {
            // Already logged by the leg; nothing to compare against.
        }
        Err(e) => {
            tracing::error!(request_id = %ctx.request_id(), error = %e, "Compare task failed");
        }
    }
}

/// The stream leg failed; let the compare leg finish but skip comparison.
async fn discard_compare_leg(ctx: Arc<RequestContext>, compare_leg: CompareLeg) {
    if let Err(e) = compare_leg.await {
        tracing::error!(request_id = %ctx.request_id(), error = %e, "Compare task failed");
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<url::Url, EngineError> {
    url::Url::parse(value).map_err(|source| EngineError::InvalidEndpoint {
        field,
        value: value.to_string(),
        source,
    })
}

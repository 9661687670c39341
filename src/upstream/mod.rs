//! Upstream subsystem: endpoints, pooled clients and the wire exchange.
//!
//! # Data Flow
//! ```text
//! Endpoint (url)
//!     → pool.rs (cached PooledClient per URL, DNS refresher task)
//!         → connection.rs (tracked sockets: peer, age, idle/busy)
//!     → client.rs (POST, Accept-Encoding per leg, x-request-id)
//!     → UpstreamResponse (status, headers, leased body)
//!     → encoding.rs (gzip/deflate decode for captured bodies)
//! ```
//!
//! # Design Decisions
//! - One keep-alive client per endpoint URL, replaced wholesale on DNS change
//! - Plain HTTP upstreams only
//! - Non-2xx upstream statuses are responses, not errors

pub mod client;
pub mod connection;
pub mod encoding;
pub mod endpoint;
pub mod pool;
pub mod resolver;

pub use client::{send, ForwardHeaders, LegMode, UpstreamBody, UpstreamError, UpstreamResponse, X_REQUEST_ID};
pub use encoding::decode_body;
pub use endpoint::{Endpoint, EndpointName};
pub use pool::{EndpointPool, PoolSettings, PoolStatus, PooledClient, RefreshOutcome};
pub use resolver::{Resolve, SystemResolver};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

//! HTTP front door subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → request.rs (request ID, JSON-RPC envelope, keep-alive preference)
//!     → proxy::DispatchEngine (both legs)
//!     → response.rs (error envelopes, relayed response head)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ConnectionPreference, RpcEnvelope, X_REQUEST_ID};
pub use server::{AppState, HttpServer};

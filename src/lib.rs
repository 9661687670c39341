//! Split JSON-RPC proxy library.
//!
//! Every request is sent to two upstream endpoints. The stream endpoint's
//! response is relayed to the client as it arrives; the compare endpoint's
//! response is buffered and checked against it for status, size and latency
//! differences.

pub mod admin;
pub mod comparison;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod upstream;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::DispatchEngine;

//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (environment overrides: PRIMARY_RPC, PORT, ...)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → consumed once by the dispatch engine and front door
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the role assignment changes at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, ComparisonConfig, EndpointsConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, PoolConfig, PrimaryRole, ProxyConfig, RelayConfig, TimeoutConfig,
};

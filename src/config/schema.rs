//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the split proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Inbound listener configuration.
    pub listener: ListenerConfig,

    /// The two upstream JSON-RPC endpoints and their initial roles.
    pub endpoints: EndpointsConfig,

    /// Mismatch detection thresholds.
    pub comparison: ComparisonConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream connection pool and DNS freshness settings.
    pub pool: PoolConfig,

    /// Streaming relay tuning.
    pub relay: RelayConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8545").
    pub bind_address: String,

    /// Largest accepted JSON-RPC body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8545".to_string(),
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Which configured endpoint currently plays the stream role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryRole {
    /// The primary URL streams, the secondary URL is compared.
    Primary,
    /// The secondary URL streams, the primary URL is compared.
    Secondary,
}

impl PrimaryRole {
    pub fn flipped(self) -> Self {
        match self {
            PrimaryRole::Primary => PrimaryRole::Secondary,
            PrimaryRole::Secondary => PrimaryRole::Primary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrimaryRole::Primary => "primary",
            PrimaryRole::Secondary => "secondary",
        }
    }
}

impl std::str::FromStr for PrimaryRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(PrimaryRole::Primary),
            "secondary" => Ok(PrimaryRole::Secondary),
            other => Err(format!("expected \"primary\" or \"secondary\", got {:?}", other)),
        }
    }
}

/// Upstream endpoint definitions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Primary JSON-RPC URL.
    pub primary_url: String,

    /// Secondary JSON-RPC URL.
    pub secondary_url: String,

    /// Initial role assignment.
    pub primary_role: PrimaryRole,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            primary_url: "http://127.0.0.1:8546".to_string(),
            secondary_url: "http://127.0.0.1:8547".to_string(),
            primary_role: PrimaryRole::Primary,
        }
    }
}

/// Response comparison configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Compare leg slower than the stream leg by more than this is a mismatch.
    pub latency_threshold_ms: u64,

    /// Absolute body size difference (bytes) tolerated between legs.
    pub size_diff_threshold: usize,

    /// Run the comparator at all.
    pub log_mismatches: bool,

    /// Attach both bodies to size/status mismatch reports.
    pub include_bodies: bool,

    /// Methods that are only ever sent to the stream endpoint.
    pub excluded_methods: Vec<String>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 1000,
            size_diff_threshold: 100,
            log_mismatches: true,
            include_bodies: true,
            excluded_methods: vec![
                "eth_sendRawTransaction".to_string(),
                "eth_sendTransaction".to_string(),
            ],
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Whole-request budget in milliseconds. Applies to the inbound request
    /// and to both upstream legs.
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            request_ms: 30_000,
        }
    }
}

/// Upstream connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How often upstream hostnames are re-resolved.
    pub dns_refresh_interval_ms: u64,

    /// Idle pooled connections older than this are closed on every refresh tick.
    pub idle_ceiling_secs: u64,

    /// Idle timeout handed to the HTTP client pool itself.
    pub idle_timeout_secs: u64,

    /// Maximum idle connections kept per upstream host.
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dns_refresh_interval_ms: 1_000,
            idle_ceiling_secs: 300,
            idle_timeout_secs: 90,
            max_idle_per_host: 10,
        }
    }
}

/// Streaming relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of body chunks buffered between the upstream reader and the
    /// client writer before the reader is suspended.
    pub write_queue_depth: usize,

    /// Disconnects within this many milliseconds of arrival are logged as
    /// benign client cancellations. Zero disables the category.
    pub fast_disconnect_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            write_queue_depth: 16,
            fast_disconnect_ms: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check both endpoint URLs are usable plain-HTTP upstreams
//! - Validate value ranges (timeouts > 0, intervals > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid URL {value:?} ({reason})")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field}: unsupported scheme {scheme:?}, only http upstreams are supported")]
    UnsupportedScheme { field: &'static str, scheme: String },

    #[error("{field}: must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_url("endpoints.primary_url", &config.endpoints.primary_url, &mut errors);
    check_url("endpoints.secondary_url", &config.endpoints.secondary_url, &mut errors);

    if config.endpoints.primary_url == config.endpoints.secondary_url {
        tracing::warn!(
            url = %config.endpoints.primary_url,
            "Primary and secondary endpoints are the same"
        );
    }

    check_address("listener.bind_address", &config.listener.bind_address, &mut errors);
    if config.admin.enabled {
        check_address("admin.bind_address", &config.admin.bind_address, &mut errors);
    }
    if config.observability.metrics_enabled {
        check_address(
            "observability.metrics_address",
            &config.observability.metrics_address,
            &mut errors,
        );
    }

    let non_zero: [(&'static str, u64); 6] = [
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("timeouts.request_ms", config.timeouts.request_ms),
        ("pool.dns_refresh_interval_ms", config.pool.dns_refresh_interval_ms),
        ("pool.idle_ceiling_secs", config.pool.idle_ceiling_secs),
        ("relay.write_queue_depth", config.relay.write_queue_depth as u64),
        ("listener.max_body_bytes", config.listener.max_body_bytes as u64),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(field: &'static str, value: &str, errors: &mut Vec<ValidationError>) {
    match Url::parse(value) {
        Ok(url) if url.scheme() != "http" => errors.push(ValidationError::UnsupportedScheme {
            field,
            scheme: url.scheme().to_string(),
        }),
        Ok(url) if url.host_str().is_none() => errors.push(ValidationError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: "missing host".to_string(),
        }),
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn check_address(field: &'static str, value: &str, errors: &mut Vec<ValidationError>) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

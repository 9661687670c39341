//! Configuration loading from disk and the environment.

use std::path::Path;
use std::fs;
use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { var: &'static str, value: String, reason: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { var, value, reason } => {
                write!(f, "Invalid {}={:?}: {}", var, value, reason)
            }
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration from an optional TOML file, apply environment
/// overrides, then validate.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ProxyConfig::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay the deployment environment variables on top of `config`.
///
/// `lookup` abstracts the environment so overrides can be exercised without
/// touching process state.
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("PRIMARY_RPC") {
        config.endpoints.primary_url = url;
    }
    if let Some(url) = lookup("SECONDARY_RPC") {
        config.endpoints.secondary_url = url;
    }
    if let Some(role) = lookup("PRIMARY_ROLE") {
        config.endpoints.primary_role = role
            .parse()
            .map_err(|reason| ConfigError::Env { var: "PRIMARY_ROLE", value: role.clone(), reason })?;
    }
    if let Some(value) = lookup("LATENCY_THRESHOLD_MS") {
        config.comparison.latency_threshold_ms = parse_env("LATENCY_THRESHOLD_MS", &value)?;
    }
    if let Some(value) = lookup("SIZE_DIFF_THRESHOLD") {
        config.comparison.size_diff_threshold = parse_env("SIZE_DIFF_THRESHOLD", &value)?;
    }
    if let Some(value) = lookup("LOG_MISMATCHES") {
        config.comparison.log_mismatches = value != "false";
    }
    if let Some(value) = lookup("PORT") {
        let port: u16 = parse_env("PORT", &value)?;
        config.listener.bind_address = format!("0.0.0.0:{}", port);
    }
    if let Some(value) = lookup("REQUEST_TIMEOUT") {
        config.timeouts.request_ms = parse_env("REQUEST_TIMEOUT", &value)?;
    }
    if let Some(value) = lookup("DNS_REFRESH_INTERVAL") {
        config.pool.dns_refresh_interval_ms = parse_env("DNS_REFRESH_INTERVAL", &value)?;
    }
    Ok(())
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PrimaryRole;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("PRIMARY_RPC", "http://geth:8545"),
            ("PRIMARY_ROLE", "secondary"),
            ("SIZE_DIFF_THRESHOLD", "512"),
            ("LOG_MISMATCHES", "false"),
            ("PORT", "9000"),
        ]);
        let mut config = ProxyConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.endpoints.primary_url, "http://geth:8545");
        assert_eq!(config.endpoints.primary_role, PrimaryRole::Secondary);
        assert_eq!(config.comparison.size_diff_threshold, 512);
        assert!(!config.comparison.log_mismatches);
        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
    }

    #[test]
    fn test_bad_env_value() {
        let vars = env(&[("REQUEST_TIMEOUT", "soon")]);
        let mut config = ProxyConfig::default();
        let err = apply_env_overrides(&mut config, |k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("REQUEST_TIMEOUT"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

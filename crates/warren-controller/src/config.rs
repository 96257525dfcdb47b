//! Configuration for the controller binary.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use warren_core::{ControllerConfig, CoreError};

/// Configuration for the Warren controller.
#[derive(Debug, Clone)]
pub struct WarrenConfig {
    /// HTTP API bind address.
    pub http_addr: SocketAddr,

    /// Run the claim and warm pool controllers (default: true).
    pub extensions: bool,

    /// Concurrent reconciles per controller (default: 4).
    pub workers: usize,

    /// DNS suffix for Service FQDNs (default: `cluster.local`).
    pub cluster_domain: String,

    /// Adoption attempts per claim (default: 5).
    pub max_adoption_attempts: usize,

    /// Export spans over OTLP (default: false).
    pub tracing_enabled: bool,

    /// Service name reported with exported spans.
    pub service_name: String,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Controller(#[from] CoreError),

    #[error("service name must not be empty when tracing is enabled")]
    EmptyServiceName,
}

impl Default for WarrenConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            extensions: true,
            workers: controller.workers,
            cluster_domain: controller.cluster_domain,
            max_adoption_attempts: controller.max_adoption_attempts,
            tracing_enabled: false,
            service_name: "warren-controller".to_string(),
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

fn flag(value: Option<String>) -> Option<bool> {
    value.map(|v| v != "false" && v != "0")
}

impl WarrenConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `WARREN_HTTP_HOST` | `0.0.0.0` |
    /// | `WARREN_HTTP_PORT` | `8080` |
    /// | `WARREN_EXTENSIONS` | `true` |
    /// | `WARREN_WORKERS` | `4` |
    /// | `WARREN_CLUSTER_DOMAIN` | `cluster.local` |
    /// | `WARREN_MAX_ADOPTION_ATTEMPTS` | `5` |
    /// | `WARREN_TRACING` | `false` |
    /// | `WARREN_SERVICE_NAME` | `warren-controller` |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = parse(lookup("WARREN_HTTP_HOST")).unwrap_or(default.http_addr.ip());
        let http_port: u16 = parse(lookup("WARREN_HTTP_PORT")).unwrap_or(default.http_addr.port());

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            extensions: flag(lookup("WARREN_EXTENSIONS")).unwrap_or(default.extensions),
            workers: parse(lookup("WARREN_WORKERS")).unwrap_or(default.workers),
            cluster_domain: lookup("WARREN_CLUSTER_DOMAIN").unwrap_or(default.cluster_domain),
            max_adoption_attempts: parse(lookup("WARREN_MAX_ADOPTION_ATTEMPTS"))
                .unwrap_or(default.max_adoption_attempts),
            tracing_enabled: flag(lookup("WARREN_TRACING")).unwrap_or(default.tracing_enabled),
            service_name: lookup("WARREN_SERVICE_NAME").unwrap_or(default.service_name),
        }
    }

    /// Settings for the controllers, validated.
    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        Ok(ControllerConfig::builder()
            .workers(self.workers)
            .cluster_domain(&self.cluster_domain)
            .max_adoption_attempts(self.max_adoption_attempts)
            .extensions(self.extensions)
            .build()?)
    }

    /// Validate the configuration.
    ///
    /// Call this at startup to get clear error messages about bad settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller_config()?;
        if self.tracing_enabled && self.service_name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = WarrenConfig::default();
        assert_eq!(config.http_addr.port(), 8080);
        assert!(config.extensions);
        assert_eq!(config.workers, 4);
        assert_eq!(config.cluster_domain, "cluster.local");
        assert_eq!(config.max_adoption_attempts, 5);
        assert!(!config.tracing_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_uses_defaults() {
        let config = WarrenConfig::from_lookup(lookup(&[]));
        let default = WarrenConfig::default();
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.workers, default.workers);
        assert_eq!(config.service_name, default.service_name);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = WarrenConfig::from_lookup(lookup(&[
            ("WARREN_HTTP_HOST", "127.0.0.1"),
            ("WARREN_HTTP_PORT", "9090"),
            ("WARREN_EXTENSIONS", "false"),
            ("WARREN_WORKERS", "8"),
            ("WARREN_CLUSTER_DOMAIN", "example.internal"),
            ("WARREN_MAX_ADOPTION_ATTEMPTS", "3"),
            ("WARREN_TRACING", "1"),
            ("WARREN_SERVICE_NAME", "warren-test"),
        ]));

        assert_eq!(config.http_addr, "127.0.0.1:9090".parse().unwrap());
        assert!(!config.extensions);
        assert_eq!(config.workers, 8);
        assert_eq!(config.cluster_domain, "example.internal");
        assert_eq!(config.max_adoption_attempts, 3);
        assert!(config.tracing_enabled);
        assert_eq!(config.service_name, "warren-test");

        let controller = config.controller_config().unwrap();
        assert_eq!(controller.workers, 8);
        assert!(!controller.extensions);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = WarrenConfig::from_lookup(lookup(&[
            ("WARREN_HTTP_PORT", "not-a-port"),
            ("WARREN_WORKERS", "-1"),
        ]));
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_validation() {
        let config = WarrenConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Controller(_))));

        let config = WarrenConfig {
            tracing_enabled: true,
            service_name: " ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyServiceName)));
    }
}

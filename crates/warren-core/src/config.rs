//! Controller configuration.

use crate::error::CoreError;
use std::time::Duration;

/// Settings shared by all controllers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconciles per controller (default: 4).
    pub workers: usize,
    /// DNS suffix for Service FQDNs (default: `cluster.local`).
    pub cluster_domain: String,
    /// Adoption attempts per claim before falling back to a fresh pod
    /// (default: 5).
    pub max_adoption_attempts: usize,
    /// Floor for expiry re-queue delays (default: 2s).
    pub min_expiry_requeue: Duration,
    /// First retry delay after a failed reconcile (default: 5ms).
    pub backoff_base: Duration,
    /// Retry delay cap (default: 5 minutes).
    pub backoff_max: Duration,
    /// Run the claim and warm pool controllers (default: false).
    pub extensions: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cluster_domain: "cluster.local".to_string(),
            max_adoption_attempts: 5,
            min_expiry_requeue: Duration::from_secs(2),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
            extensions: false,
        }
    }
}

impl ControllerConfig {
    /// Create a new config builder.
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.workers == 0 {
            return Err(CoreError::InvalidConfig("workers must be > 0".into()));
        }
        if self.cluster_domain.is_empty() {
            return Err(CoreError::InvalidConfig("cluster_domain is required".into()));
        }
        if self.max_adoption_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "max_adoption_attempts must be > 0".into(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(CoreError::InvalidConfig(
                "backoff_base must be > 0 and <= backoff_max".into(),
            ));
        }
        Ok(())
    }

    /// DNS name of a Service in this cluster.
    pub fn service_fqdn(&self, service: &str, namespace: &str) -> String {
        format!("{service}.{namespace}.svc.{}", self.cluster_domain)
    }
}

/// Builder for ControllerConfig.
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.cluster_domain = domain.into();
        self
    }

    pub fn max_adoption_attempts(mut self, attempts: usize) -> Self {
        self.config.max_adoption_attempts = attempts;
        self
    }

    pub fn min_expiry_requeue(mut self, delay: Duration) -> Self {
        self.config.min_expiry_requeue = delay;
        self
    }

    /// Set the retry backoff range.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.backoff_max = max;
        self
    }

    pub fn extensions(mut self, enabled: bool) -> Self {
        self.config.extensions = enabled;
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<ControllerConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

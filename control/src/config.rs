//! Configuration for the gateway controller
//!
//! Values are resolved once at startup and handed to translators and
//! reconcilers; nothing reads the environment after that.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Controller name advertised in GatewayClass `spec.controllerName`
pub const DEFAULT_CONTROLLER_NAME: &str = "io.cilium/gateway-controller";

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Controller identity compared against GatewayClass `spec.controllerName`
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Namespace TLS secrets are synced into for the proxy
    #[serde(default = "default_secrets_namespace")]
    pub secrets_namespace: String,

    /// Redirect plain HTTP to HTTPS for Ingress hosts that have a certificate
    #[serde(default = "default_true")]
    pub enforce_https: bool,

    /// Ingress support (dedicated load balancer per Ingress)
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Periodic requeue after a successful reconcile, in seconds
    #[serde(default = "default_requeue_secs")]
    pub requeue_secs: u64,

    /// Requeue delay after a failed reconcile, in seconds
    #[serde(default = "default_error_requeue_secs")]
    pub error_requeue_secs: u64,

    /// Address for the Prometheus `/metrics` endpoint; disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

/// Ingress configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// IngressClass name handled by this controller
    #[serde(default = "default_ingress_class")]
    pub class_name: String,
}

fn default_controller_name() -> String {
    DEFAULT_CONTROLLER_NAME.to_string()
}

fn default_secrets_namespace() -> String {
    "cilium-secrets".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ingress_class() -> String {
    "cilium".to_string()
}

fn default_requeue_secs() -> u64 {
    300
}

fn default_error_requeue_secs() -> u64 {
    60
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            class_name: default_ingress_class(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            secrets_namespace: default_secrets_namespace(),
            enforce_https: default_true(),
            ingress: IngressConfig::default(),
            requeue_secs: default_requeue_secs(),
            error_requeue_secs: default_error_requeue_secs(),
            metrics_addr: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = lookup("CILIUM_GATEWAY_CONTROLLER_NAME") {
            config.controller_name = val;
        }
        if let Some(val) = lookup("CILIUM_SECRETS_NAMESPACE") {
            config.secrets_namespace = val;
        }
        if let Some(val) = lookup("CILIUM_ENFORCE_HTTPS") {
            config.enforce_https = parse_bool("CILIUM_ENFORCE_HTTPS", &val)?;
        }
        if let Some(val) = lookup("CILIUM_INGRESS_ENABLED") {
            config.ingress.enabled = parse_bool("CILIUM_INGRESS_ENABLED", &val)?;
        }
        if let Some(val) = lookup("CILIUM_INGRESS_CLASS") {
            config.ingress.class_name = val;
        }
        if let Some(val) = lookup("CILIUM_REQUEUE_SECS") {
            config.requeue_secs = parse_secs("CILIUM_REQUEUE_SECS", &val)?;
        }
        if let Some(val) = lookup("CILIUM_ERROR_REQUEUE_SECS") {
            config.error_requeue_secs = parse_secs("CILIUM_ERROR_REQUEUE_SECS", &val)?;
        }
        if let Some(val) = lookup("CILIUM_METRICS_ADDR") {
            config.metrics_addr = Some(val).filter(|v| !v.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_name.is_empty() {
            return Err(Error::Config("controller name must not be empty".to_string()));
        }
        if self.secrets_namespace.is_empty() {
            return Err(Error::Config("secrets namespace must not be empty".to_string()));
        }
        if self.ingress.enabled && self.ingress.class_name.is_empty() {
            return Err(Error::Config("ingress class name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn error_requeue_interval(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool> {
    val.trim()
        .parse::<bool>()
        .map_err(|_| Error::Config(format!("{key} must be true or false, got '{val}'")))
}

fn parse_secs(key: &str, val: &str) -> Result<u64> {
    match val.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(Error::Config(format!(
            "{key} must be a positive number of seconds, got '{val}'"
        ))),
        Ok(secs) => Ok(secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.controller_name, "io.cilium/gateway-controller");
        assert_eq!(config.secrets_namespace, "cilium-secrets");
        assert!(config.enforce_https);
        assert!(config.ingress.enabled);
        assert_eq!(config.ingress.class_name, "cilium");
        assert_eq!(config.requeue_interval(), Duration::from_secs(300));
        assert_eq!(config.error_requeue_interval(), Duration::from_secs(60));
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("CILIUM_GATEWAY_CONTROLLER_NAME", "example.com/gateway"),
            ("CILIUM_ENFORCE_HTTPS", "false"),
            ("CILIUM_INGRESS_CLASS", "edge"),
            ("CILIUM_ERROR_REQUEUE_SECS", "5"),
            ("CILIUM_METRICS_ADDR", "0.0.0.0:9962"),
        ]))
        .expect("valid config");

        assert_eq!(config.controller_name, "example.com/gateway");
        assert!(!config.enforce_https);
        assert_eq!(config.ingress.class_name, "edge");
        assert_eq!(config.error_requeue_secs, 5);
        assert_eq!(config.metrics_addr.as_deref(), Some("0.0.0.0:9962"));
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let result = ControllerConfig::from_lookup(lookup(&[("CILIUM_ENFORCE_HTTPS", "yes")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_requeue_rejected() {
        let result = ControllerConfig::from_lookup(lookup(&[("CILIUM_REQUEUE_SECS", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_controller_name_rejected() {
        let result =
            ControllerConfig::from_lookup(lookup(&[("CILIUM_GATEWAY_CONTROLLER_NAME", "")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"controller_name": "x/y"}"#).expect("deserialize");
        assert_eq!(config.controller_name, "x/y");
        assert_eq!(config.secrets_namespace, "cilium-secrets");
        assert!(config.ingress.enabled);
    }
}

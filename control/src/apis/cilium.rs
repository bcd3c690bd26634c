//! CiliumEnvoyConfig custom resource
//!
//! Only the fields the translators write are modelled. Envoy resources are
//! carried as opaque JSON documents keyed by their `@type`.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "cilium.io",
    version = "v2",
    kind = "CiliumEnvoyConfig",
    plural = "ciliumenvoyconfigs",
    shortname = "cec",
    namespaced,
    schema = "disabled",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEnvoyConfigSpec {
    /// Services whose traffic is redirected to the Envoy listener
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceListener>,

    /// Services whose endpoints are synced to Envoy as EDS clusters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_services: Vec<BackendService>,

    /// Envoy xDS resources (listeners, route configurations, clusters)
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceListener {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub name: String,
    pub namespace: String,
    /// Port numbers or names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub number: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_resource_identity() {
        assert_eq!(CiliumEnvoyConfig::kind(&()), "CiliumEnvoyConfig");
        assert_eq!(CiliumEnvoyConfig::api_version(&()), "cilium.io/v2");
        assert_eq!(CiliumEnvoyConfig::plural(&()), "ciliumenvoyconfigs");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = CiliumEnvoyConfigSpec {
            backend_services: vec![BackendService {
                name: "web".to_string(),
                namespace: "default".to_string(),
                number: vec!["8080".to_string()],
            }],
            ..Default::default()
        };

        let value = serde_json::to_value(&spec).expect("serialize");
        assert!(value.get("backendServices").is_some());
        assert!(value.get("services").is_none(), "empty services omitted");
    }
}

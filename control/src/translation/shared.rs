use super::{
    envoy, first_source, object_meta, owner_reference, placeholder_endpoints, DerivedResources,
    Translator,
};
use crate::apis::cilium::{BackendService, CiliumEnvoyConfig, CiliumEnvoyConfigSpec, ServiceListener};
use crate::error::TranslationError;
use common::RoutingModel;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use std::collections::{BTreeMap, BTreeSet};

/// Translates all sources of a model into one shared set of resources.
///
/// Name and namespace are fixed by the caller; the owner reference comes
/// from the model's primary source.
#[derive(Debug, Clone)]
pub struct SharedTranslator {
    name: String,
    namespace: String,
    secrets_namespace: String,
    enforce_https: bool,
    label_key: String,
}

impl SharedTranslator {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        secrets_namespace: impl Into<String>,
        enforce_https: bool,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            secrets_namespace: secrets_namespace.into(),
            enforce_https,
            label_key: super::GATEWAY_LABEL_KEY.to_string(),
        }
    }

    /// Mark derived resources with a different managed label
    pub fn with_label_key(mut self, label_key: impl Into<String>) -> Self {
        self.label_key = label_key.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend_services(model: &RoutingModel) -> Vec<BackendService> {
        let mut grouped: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for backend in model.backends() {
            let ports = grouped
                .entry((backend.namespace.clone(), backend.name.clone()))
                .or_default();
            let port = backend.port_key();
            if !port.is_empty() {
                ports.insert(port);
            }
        }
        grouped
            .into_iter()
            .map(|((namespace, name), ports)| BackendService {
                name,
                namespace,
                number: ports.into_iter().collect(),
            })
            .collect()
    }

    fn service_ports(model: &RoutingModel) -> Vec<ServicePort> {
        model
            .ports()
            .into_iter()
            .filter_map(|port| i32::try_from(port).ok())
            .map(|port| ServicePort {
                name: Some(format!("port-{port}")),
                protocol: Some("TCP".to_string()),
                port,
                ..Default::default()
            })
            .collect()
    }
}

impl Translator for SharedTranslator {
    fn translate(&self, model: &RoutingModel) -> Result<DerivedResources, TranslationError> {
        let source = first_source(model)?;
        let owner = owner_reference(source);
        let meta = object_meta(&self.name, &self.namespace, &self.label_key, owner);

        let envoy_config = CiliumEnvoyConfig {
            metadata: meta.clone(),
            spec: CiliumEnvoyConfigSpec {
                services: vec![ServiceListener {
                    name: self.name.clone(),
                    namespace: self.namespace.clone(),
                    ..Default::default()
                }],
                backend_services: Self::backend_services(model),
                resources: envoy::resources(model, &self.secrets_namespace, self.enforce_https),
            },
        };

        let service = Service {
            metadata: meta.clone(),
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(Self::service_ports(model)),
                ..Default::default()
            }),
            status: None,
        };

        Ok(DerivedResources {
            envoy_config,
            service,
            endpoints: placeholder_endpoints(meta),
        })
    }
}

use super::{
    first_source, object_meta, placeholder_endpoints, DerivedResources, SharedTranslator,
    Translator, INGRESS_LABEL_KEY, INGRESS_PREFIX,
};
use crate::error::TranslationError;
use common::{FullyQualifiedResource, RoutingModel};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

const INGRESS_API_VERSION: &str = "networking.k8s.io/v1";

/// One load balancer per Ingress.
///
/// The proxy configuration is produced by [`SharedTranslator`] over a model
/// that only holds the listeners of a single Ingress, then renamed so that
/// names stay unique across namespaces.
#[derive(Debug, Clone)]
pub struct DedicatedTranslator {
    secrets_namespace: String,
    enforce_https: bool,
}

impl DedicatedTranslator {
    pub fn new(secrets_namespace: impl Into<String>, enforce_https: bool) -> Self {
        Self {
            secrets_namespace: secrets_namespace.into(),
            enforce_https,
        }
    }

    /// Name of the Service and Endpoints derived for an Ingress
    pub fn service_name(ingress_name: &str) -> String {
        format!("{INGRESS_PREFIX}-{ingress_name}")
    }

    /// Name of the CiliumEnvoyConfig derived for an Ingress
    pub fn envoy_config_name(namespace: &str, ingress_name: &str) -> String {
        format!("{INGRESS_PREFIX}-{namespace}-{ingress_name}")
    }

    fn ingress_owner(source: &FullyQualifiedResource) -> OwnerReference {
        OwnerReference {
            api_version: INGRESS_API_VERSION.to_string(),
            kind: "Ingress".to_string(),
            name: source.name.clone(),
            uid: source.uid.clone(),
            ..Default::default()
        }
    }

    fn service_ports() -> Vec<ServicePort> {
        [("http", 80), ("https", 443)]
            .into_iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.to_string()),
                protocol: Some("TCP".to_string()),
                port,
                ..Default::default()
            })
            .collect()
    }
}

impl Translator for DedicatedTranslator {
    fn translate(&self, model: &RoutingModel) -> Result<DerivedResources, TranslationError> {
        let source = first_source(model)?;
        let service_name = Self::service_name(&source.name);

        let shared = SharedTranslator::new(
            &service_name,
            &source.namespace,
            &self.secrets_namespace,
            self.enforce_https,
        )
        .with_label_key(INGRESS_LABEL_KEY);
        let mut envoy_config = shared.translate(model)?.envoy_config;

        let owner = Self::ingress_owner(source);
        envoy_config.metadata.name = Some(Self::envoy_config_name(&source.namespace, &source.name));
        envoy_config.metadata.owner_references = Some(vec![owner.clone()]);

        let meta = object_meta(&service_name, &source.namespace, INGRESS_LABEL_KEY, owner);
        let service = Service {
            metadata: meta.clone(),
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(Self::service_ports()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::{PLACEHOLDER_ENDPOINT_IP, PLACEHOLDER_ENDPOINT_PORT};
    use common::{Backend, BackendPort, HttpListener, HttpRoute, TlsSecret};

    fn ingress(namespace: &str, name: &str, uid: &str) -> FullyQualifiedResource {
        FullyQualifiedResource {
            name: name.to_string(),
            namespace: namespace.to_string(),
            group: "networking.k8s.io".to_string(),
            version: "v1".to_string(),
            kind: "Ingress".to_string(),
            uid: uid.to_string(),
        }
    }

    fn model_for(source: FullyQualifiedResource) -> RoutingModel {
        let route = HttpRoute {
            backends: vec![Backend {
                name: "web".to_string(),
                namespace: source.namespace.clone(),
                port: Some(BackendPort {
                    port: 8080,
                    name: String::new(),
                }),
            }],
            ..Default::default()
        };
        RoutingModel::new(vec![
            HttpListener {
                name: "ing-http".to_string(),
                sources: vec![source.clone()],
                port: 80,
                hostname: "shop.example.com".to_string(),
                routes: vec![route.clone()],
                ..Default::default()
            },
            HttpListener {
                name: "ing-https".to_string(),
                sources: vec![source.clone()],
                port: 443,
                hostname: "shop.example.com".to_string(),
                tls: vec![TlsSecret {
                    name: "shop-cert".to_string(),
                    namespace: source.namespace.clone(),
                }],
                routes: vec![route],
                ..Default::default()
            },
        ])
    }

    fn translator() -> DedicatedTranslator {
        DedicatedTranslator::new("cilium-secrets", true)
    }

    #[test]
    fn test_empty_model_fails() {
        let err = translator()
            .translate(&RoutingModel::new(vec![HttpListener::default()]))
            .unwrap_err();
        assert_eq!(err, TranslationError::EmptyModel);
    }

    #[test]
    fn test_dedicated_names() {
        let derived = translator()
            .translate(&model_for(ingress("ns", "foo", "u1")))
            .expect("translate");

        assert_eq!(
            derived.envoy_config.metadata.name.as_deref(),
            Some("cilium-ingress-ns-foo")
        );
        assert_eq!(derived.service.metadata.name.as_deref(), Some("cilium-ingress-foo"));
        assert_eq!(derived.endpoints.metadata.name.as_deref(), Some("cilium-ingress-foo"));
        for meta in [
            &derived.envoy_config.metadata,
            &derived.service.metadata,
            &derived.endpoints.metadata,
        ] {
            assert_eq!(meta.namespace.as_deref(), Some("ns"));
        }
    }

    #[test]
    fn test_owner_is_the_ingress() {
        let derived = translator()
            .translate(&model_for(ingress("ns", "foo", "u1")))
            .expect("translate");

        for meta in [
            &derived.envoy_config.metadata,
            &derived.service.metadata,
            &derived.endpoints.metadata,
        ] {
            let owners = meta.owner_references.as_ref().expect("owners");
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].api_version, "networking.k8s.io/v1");
            assert_eq!(owners[0].kind, "Ingress");
            assert_eq!(owners[0].name, "foo");
            assert_eq!(owners[0].uid, "u1");
            let labels = meta.labels.as_ref().expect("labels");
            assert_eq!(labels.get(INGRESS_LABEL_KEY).map(String::as_str), Some("true"));
        }
    }

    #[test]
    fn test_service_exposes_http_and_https() {
        let derived = translator()
            .translate(&model_for(ingress("ns", "foo", "u1")))
            .expect("translate");

        let spec = derived.service.spec.expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        let ports: Vec<(Option<String>, i32)> = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p.name, p.port))
            .collect();
        assert_eq!(
            ports,
            vec![(Some("http".to_string()), 80), (Some("https".to_string()), 443)]
        );
    }

    #[test]
    fn test_placeholder_endpoint() {
        let derived = translator()
            .translate(&model_for(ingress("ns", "foo", "u1")))
            .expect("translate");

        let subsets = derived.endpoints.subsets.expect("subsets");
        assert_eq!(subsets.len(), 1);
        let addresses = subsets[0].addresses.as_ref().expect("addresses");
        let ports = subsets[0].ports.as_ref().expect("ports");
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].ip, PLACEHOLDER_ENDPOINT_IP);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, PLACEHOLDER_ENDPOINT_PORT);
    }

    #[test]
    fn test_envoy_config_redirects_to_service() {
        let derived = translator()
            .translate(&model_for(ingress("ns", "foo", "u1")))
            .expect("translate");

        let spec = &derived.envoy_config.spec;
        assert_eq!(spec.services.len(), 1);
        assert_eq!(spec.services[0].name, "cilium-ingress-foo");
        assert_eq!(spec.services[0].namespace, "ns");
        assert_eq!(spec.backend_services.len(), 1);
        assert!(!spec.resources.is_empty());
    }

    #[test]
    fn test_names_unique_across_namespaces() {
        let a = translator()
            .translate(&model_for(ingress("team-a", "web", "u1")))
            .expect("translate");
        let b = translator()
            .translate(&model_for(ingress("team-b", "web", "u2")))
            .expect("translate");

        assert_ne!(a.envoy_config.metadata.name, b.envoy_config.metadata.name);
    }

    #[test]
    fn test_translation_is_idempotent() {
        let model = model_for(ingress("ns", "foo", "u1"));
        assert_eq!(
            translator().translate(&model).expect("translate"),
            translator().translate(&model).expect("translate")
        );
    }
}

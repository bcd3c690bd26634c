//! Ingress → routing model
//!
//! Each Ingress becomes its own model: one plain HTTP listener per host and
//! one TLS listener per host covered by a `spec.tls` entry.

use common::{
    Backend, BackendPort, FullyQualifiedResource, HttpListener, HttpRoute, RoutingModel,
    StringMatch, TlsSecret, WILDCARD_HOSTNAME,
};
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressBackend};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Legacy annotation selecting an ingress class
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

const INSECURE_PORT: u32 = 80;
const SECURE_PORT: u32 = 443;

/// Class requested by an Ingress; `spec.ingressClassName` wins over the
/// legacy annotation
pub fn ingress_class(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
        .or_else(|| {
            ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
                .map(String::as_str)
        })
}

pub fn ingress_source(ingress: &Ingress) -> FullyQualifiedResource {
    FullyQualifiedResource {
        name: ingress.name_any(),
        namespace: ingress.namespace().unwrap_or_default(),
        group: "networking.k8s.io".to_string(),
        version: "v1".to_string(),
        kind: "Ingress".to_string(),
        uid: ingress.uid().unwrap_or_default(),
    }
}

fn backend(namespace: &str, ingress_backend: &IngressBackend) -> Option<Backend> {
    let service = ingress_backend.service.as_ref()?;
    let port = service.port.as_ref().map(|p| BackendPort {
        port: p
            .number
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_default(),
        name: p.name.clone().unwrap_or_default(),
    });
    Some(Backend {
        name: service.name.clone(),
        namespace: namespace.to_string(),
        port,
    })
}

fn path_match(path: &HTTPIngressPath) -> StringMatch {
    let value = path.path.clone().unwrap_or_else(|| "/".to_string());
    match path.path_type.as_str() {
        "Exact" => StringMatch::Exact(value),
        "Prefix" => StringMatch::Prefix(value),
        // ImplementationSpecific paths are interpreted as regular expressions
        _ => StringMatch::Regex(value),
    }
}

/// Routes per host, hosts sorted; rules without a host land on `*`
fn routes_by_host(ingress: &Ingress) -> BTreeMap<String, Vec<HttpRoute>> {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = format!("{}/{}", namespace, ingress.name_any());
    let mut hosts: BTreeMap<String, Vec<HttpRoute>> = BTreeMap::new();

    let Some(spec) = ingress.spec.as_ref() else {
        return hosts;
    };

    for rule in spec.rules.iter().flatten() {
        let host = rule
            .host
            .clone()
            .unwrap_or_else(|| WILDCARD_HOSTNAME.to_string());
        let routes = hosts.entry(host).or_default();
        for path in rule.http.iter().flat_map(|http| http.paths.iter()) {
            routes.push(HttpRoute {
                name: name.clone(),
                hostnames: Vec::new(),
                path_match: path_match(path),
                backends: backend(&namespace, &path.backend).into_iter().collect(),
            });
        }
    }

    if let Some(default) = spec.default_backend.as_ref() {
        hosts
            .entry(WILDCARD_HOSTNAME.to_string())
            .or_default()
            .push(HttpRoute {
                name: name.clone(),
                hostnames: Vec::new(),
                path_match: StringMatch::default(),
                backends: backend(&namespace, default).into_iter().collect(),
            });
    }

    hosts
}

/// TLS secret per host, first `spec.tls` entry wins
fn tls_by_host(ingress: &Ingress) -> BTreeMap<String, TlsSecret> {
    let namespace = ingress.namespace().unwrap_or_default();
    let mut secrets = BTreeMap::new();
    let entries = ingress.spec.iter().flat_map(|spec| spec.tls.iter().flatten());
    for tls in entries {
        let Some(secret_name) = tls.secret_name.as_ref() else {
            continue;
        };
        for host in tls.hosts.iter().flatten() {
            secrets.entry(host.clone()).or_insert_with(|| TlsSecret {
                name: secret_name.clone(),
                namespace: namespace.clone(),
            });
        }
    }
    secrets
}

fn listener_name(source: &FullyQualifiedResource, host: &str, port: u32) -> String {
    format!("ing-{}-{}-{}-{}", source.name, source.namespace, host, port)
}

/// Build the routing model of one Ingress.
///
/// An Ingress without rules or default backend yields an empty model.
pub fn build_model(ingress: &Ingress) -> RoutingModel {
    let source = ingress_source(ingress);
    let routes = routes_by_host(ingress);
    let tls = tls_by_host(ingress);
    let mut listeners = Vec::new();

    for (host, host_routes) in &routes {
        listeners.push(HttpListener {
            name: listener_name(&source, host, INSECURE_PORT),
            sources: vec![source.clone()],
            address: String::new(),
            port: INSECURE_PORT,
            hostname: host.clone(),
            tls: Vec::new(),
            routes: host_routes.clone(),
        });
    }

    for (host, secret) in &tls {
        let host_routes = routes
            .get(host)
            .or_else(|| routes.get(WILDCARD_HOSTNAME))
            .cloned()
            .unwrap_or_default();
        listeners.push(HttpListener {
            name: listener_name(&source, host, SECURE_PORT),
            sources: vec![source.clone()],
            address: String::new(),
            port: SECURE_PORT,
            hostname: host.clone(),
            tls: vec![secret.clone()],
            routes: host_routes,
        });
    }

    RoutingModel::new(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressRuleValue, IngressRule, IngressServiceBackend, IngressSpec, IngressTLS,
        ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service_backend(name: &str, port: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn ingress(spec: IngressSpec) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("shop".to_string()),
                namespace: Some("retail".to_string()),
                uid: Some("uid-shop".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    fn rule(host: Option<&str>, paths: Vec<(&str, &str, &str)>) -> IngressRule {
        IngressRule {
            host: host.map(str::to_string),
            http: Some(HTTPIngressRuleValue {
                paths: paths
                    .into_iter()
                    .map(|(path, path_type, service)| HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: path_type.to_string(),
                        backend: service_backend(service, 8080),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn test_class_from_spec_or_annotation() {
        let mut ing = ingress(IngressSpec {
            ingress_class_name: Some("cilium".to_string()),
            ..Default::default()
        });
        assert_eq!(ingress_class(&ing), Some("cilium"));

        ing.spec = Some(IngressSpec::default());
        ing.metadata.annotations = Some(BTreeMap::from([(
            INGRESS_CLASS_ANNOTATION.to_string(),
            "legacy".to_string(),
        )]));
        assert_eq!(ingress_class(&ing), Some("legacy"));

        ing.metadata.annotations = None;
        assert_eq!(ingress_class(&ing), None);
    }

    #[test]
    fn test_listener_per_host() {
        let model = build_model(&ingress(IngressSpec {
            rules: Some(vec![
                rule(Some("b.example.com"), vec![("/", "Prefix", "web")]),
                rule(Some("a.example.com"), vec![("/exact", "Exact", "api")]),
            ]),
            ..Default::default()
        }));

        let hosts: Vec<&str> = model.http.iter().map(|l| l.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com"]);
        assert!(model.http.iter().all(|l| l.port == 80));
        assert_eq!(
            model.http[0].routes[0].path_match,
            StringMatch::Exact("/exact".to_string())
        );
        assert_eq!(model.http[0].routes[0].backends[0].namespace, "retail");
    }

    #[test]
    fn test_tls_host_gets_secure_listener() {
        let model = build_model(&ingress(IngressSpec {
            rules: Some(vec![rule(Some("shop.example.com"), vec![("/", "Prefix", "web")])]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec!["shop.example.com".to_string()]),
                secret_name: Some("shop-cert".to_string()),
            }]),
            ..Default::default()
        }));

        assert_eq!(model.http.len(), 2);
        let secure = &model.http[1];
        assert_eq!(secure.port, 443);
        assert_eq!(
            secure.tls,
            vec![TlsSecret {
                name: "shop-cert".to_string(),
                namespace: "retail".to_string(),
            }]
        );
        assert_eq!(secure.routes, model.http[0].routes);
    }

    #[test]
    fn test_default_backend_on_wildcard_host() {
        let model = build_model(&ingress(IngressSpec {
            default_backend: Some(service_backend("fallback", 80)),
            ..Default::default()
        }));

        assert_eq!(model.http.len(), 1);
        assert_eq!(model.http[0].hostname, "*");
        assert_eq!(model.http[0].routes[0].backends[0].name, "fallback");
    }

    #[test]
    fn test_implementation_specific_is_regex() {
        let model = build_model(&ingress(IngressSpec {
            rules: Some(vec![rule(None, vec![("/v[0-9]+/", "ImplementationSpecific", "api")])]),
            ..Default::default()
        }));
        assert_eq!(
            model.http[0].routes[0].path_match,
            StringMatch::Regex("/v[0-9]+/".to_string())
        );
    }

    #[test]
    fn test_source_identity() {
        let model = build_model(&ingress(IngressSpec {
            default_backend: Some(service_backend("fallback", 80)),
            ..Default::default()
        }));
        let source = model.primary_source().expect("source");
        assert_eq!(source.name, "shop");
        assert_eq!(source.namespace, "retail");
        assert_eq!(source.uid, "uid-shop");
        assert_eq!(source.kind, "Ingress");
    }

    #[test]
    fn test_empty_ingress_is_empty_model() {
        assert!(build_model(&ingress(IngressSpec::default())).is_empty());
    }
}

//! Gateway + HTTPRoutes → routing model

use super::predicates::{is_secret_ref, GatewayKey};
use common::{
    Backend, BackendPort, FullyQualifiedResource, HttpListener, HttpRoute as ModelRoute,
    RoutingModel, StringMatch, TlsSecret, WILDCARD_HOSTNAME,
};
use gateway_api::apis::standard::gateways::{Gateway, GatewayListeners};
use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteParentRefs, HTTPRouteRules, HTTPRouteRulesMatchesPath,
    HTTPRouteRulesMatchesPathType,
};
use kube::ResourceExt;
use tracing::debug;

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
pub const GATEWAY_API_VERSION: &str = "v1";

/// Listener protocols translated into HTTP listeners
fn is_http_protocol(protocol: &str) -> bool {
    matches!(protocol, "HTTP" | "HTTPS")
}

fn gateway_source(gateway: &Gateway) -> FullyQualifiedResource {
    FullyQualifiedResource {
        name: gateway.name_any(),
        namespace: gateway.namespace().unwrap_or_default(),
        group: GATEWAY_API_GROUP.to_string(),
        version: GATEWAY_API_VERSION.to_string(),
        kind: "Gateway".to_string(),
        uid: gateway.uid().unwrap_or_default(),
    }
}

fn targets_gateway(parent: &HTTPRouteParentRefs, route_namespace: &str, key: &GatewayKey) -> bool {
    let group = parent.group.as_deref().unwrap_or(GATEWAY_API_GROUP);
    let kind = parent.kind.as_deref().unwrap_or("Gateway");
    let namespace = parent.namespace.as_deref().unwrap_or(route_namespace);
    group == GATEWAY_API_GROUP
        && kind == "Gateway"
        && parent.name == key.name
        && namespace == key.namespace
}

/// True when `route` has a parent ref selecting `listener` of the gateway
pub fn attaches_to_listener(route: &HTTPRoute, key: &GatewayKey, listener: &GatewayListeners) -> bool {
    let route_namespace = route.namespace().unwrap_or_default();
    route.spec.parent_refs.iter().flatten().any(|parent| {
        targets_gateway(parent, &route_namespace, key)
            && parent
                .section_name
                .as_deref()
                .map_or(true, |section| section == listener.name)
            && parent.port.map_or(true, |port| port == listener.port)
    })
}

/// Routes attached to any listener of the gateway, in input order
pub fn attached_routes<'a>(gateway: &Gateway, routes: &'a [HTTPRoute]) -> Vec<&'a HTTPRoute> {
    let key = GatewayKey::of(gateway);
    routes
        .iter()
        .filter(|route| {
            gateway
                .spec
                .listeners
                .iter()
                .any(|listener| attaches_to_listener(route, &key, listener))
        })
        .collect()
}

/// Number of routes attached to each listener, in listener order
pub fn attached_route_counts(gateway: &Gateway, routes: &[HTTPRoute]) -> Vec<(String, usize)> {
    let key = GatewayKey::of(gateway);
    gateway
        .spec
        .listeners
        .iter()
        .map(|listener| {
            let count = routes
                .iter()
                .filter(|route| attaches_to_listener(route, &key, listener))
                .count();
            (listener.name.clone(), count)
        })
        .collect()
}

fn listener_tls(gateway_namespace: &str, listener: &GatewayListeners) -> Vec<TlsSecret> {
    listener
        .tls
        .iter()
        .filter_map(|tls| tls.certificate_refs.as_ref())
        .flatten()
        .filter(|cert| is_secret_ref(cert.group.as_deref(), cert.kind.as_deref()))
        .map(|cert| TlsSecret {
            name: cert.name.clone(),
            namespace: cert
                .namespace
                .clone()
                .unwrap_or_else(|| gateway_namespace.to_string()),
        })
        .collect()
}

fn path_match(path: Option<&HTTPRouteRulesMatchesPath>) -> StringMatch {
    let Some(path) = path else {
        return StringMatch::default();
    };
    let value = path.value.clone().unwrap_or_else(|| "/".to_string());
    match path.r#type {
        Some(HTTPRouteRulesMatchesPathType::Exact) => StringMatch::Exact(value),
        Some(HTTPRouteRulesMatchesPathType::RegularExpression) => StringMatch::Regex(value),
        Some(HTTPRouteRulesMatchesPathType::PathPrefix) | None => StringMatch::Prefix(value),
    }
}

fn rule_backends(route_namespace: &str, rule: &HTTPRouteRules) -> Vec<Backend> {
    rule.backend_refs
        .iter()
        .flatten()
        .filter(|b| b.group.as_deref().unwrap_or("").is_empty())
        .filter(|b| b.kind.as_deref().unwrap_or("Service") == "Service")
        .map(|b| Backend {
            name: b.name.clone(),
            namespace: b
                .namespace
                .clone()
                .unwrap_or_else(|| route_namespace.to_string()),
            port: b
                .port
                .and_then(|port| u32::try_from(port).ok())
                .map(|port| BackendPort {
                    port,
                    name: String::new(),
                }),
        })
        .collect()
}

/// Flatten an HTTPRoute into model routes: one per rule match
fn model_routes(route: &HTTPRoute) -> Vec<ModelRoute> {
    let route_namespace = route.namespace().unwrap_or_default();
    let name = format!("{}/{}", route_namespace, route.name_any());
    let hostnames = route.spec.hostnames.clone().unwrap_or_default();

    let mut out = Vec::new();
    for rule in route.spec.rules.iter().flatten() {
        let backends = rule_backends(&route_namespace, rule);
        let paths: Vec<StringMatch> = match rule.matches.as_deref() {
            Some(matches) if !matches.is_empty() => {
                matches.iter().map(|m| path_match(m.path.as_ref())).collect()
            }
            _ => vec![StringMatch::default()],
        };
        for path in paths {
            out.push(ModelRoute {
                name: name.clone(),
                hostnames: hostnames.clone(),
                path_match: path,
                backends: backends.clone(),
            });
        }
    }
    out
}

/// Build the routing model of a gateway from the routes attached to it.
///
/// Only HTTP and HTTPS listeners are represented. The result is empty when
/// the gateway has none.
pub fn build_model(gateway: &Gateway, routes: &[HTTPRoute]) -> RoutingModel {
    let key = GatewayKey::of(gateway);
    let source = gateway_source(gateway);
    let namespace = gateway.namespace().unwrap_or_default();

    let listeners = gateway
        .spec
        .listeners
        .iter()
        .filter(|listener| {
            let supported = is_http_protocol(&listener.protocol);
            if !supported {
                debug!(
                    "Gateway {} listener {} has unsupported protocol {}",
                    key, listener.name, listener.protocol
                );
            }
            supported
        })
        .filter_map(|listener| {
            let Ok(port) = u32::try_from(listener.port) else {
                debug!(
                    "Gateway {} listener {} has invalid port {}",
                    key, listener.name, listener.port
                );
                return None;
            };
            Some(HttpListener {
                name: listener.name.clone(),
                sources: vec![source.clone()],
                address: String::new(),
                port,
                hostname: listener
                    .hostname
                    .clone()
                    .unwrap_or_else(|| WILDCARD_HOSTNAME.to_string()),
                tls: if listener.protocol == "HTTPS" {
                    listener_tls(&namespace, listener)
                } else {
                    Vec::new()
                },
                routes: routes
                    .iter()
                    .filter(|route| attaches_to_listener(route, &key, listener))
                    .flat_map(model_routes)
                    .collect(),
            })
        })
        .collect();

    RoutingModel::new(listeners)
}

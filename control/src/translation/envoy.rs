//! Minimal Envoy xDS rendering
//!
//! Produces one listener, the insecure/secure route configurations and one
//! EDS cluster per backend. Everything is keyed through ordered collections.

use common::{HttpListener, HttpRoute, RoutingModel, StringMatch, TlsSecret, WILDCARD_HOSTNAME};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const LISTENER_NAME: &str = "listener";
pub(crate) const INSECURE_ROUTE_CONFIG: &str = "listener-insecure";
pub(crate) const SECURE_ROUTE_CONFIG: &str = "listener-secure";

const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
const ROUTE_CONFIG_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
const HCM_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TLS_CONTEXT_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
const TLS_INSPECTOR_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";

/// Routes grouped by virtual host, split by transport
#[derive(Debug, Default)]
struct VirtualHosts<'a> {
    insecure: BTreeMap<String, Vec<&'a HttpRoute>>,
    secure: BTreeMap<String, Vec<&'a HttpRoute>>,
}

fn route_hosts<'a>(listener: &'a HttpListener, route: &'a HttpRoute) -> Vec<&'a str> {
    if route.hostnames.is_empty() {
        vec![listener.hostname_or_wildcard()]
    } else {
        route.hostnames.iter().map(String::as_str).collect()
    }
}

trait ListenerExt {
    fn hostname_or_wildcard(&self) -> &str;
}

impl ListenerExt for HttpListener {
    fn hostname_or_wildcard(&self) -> &str {
        if self.hostname.is_empty() {
            WILDCARD_HOSTNAME
        } else {
            &self.hostname
        }
    }
}

fn virtual_hosts(model: &RoutingModel) -> VirtualHosts<'_> {
    let mut hosts = VirtualHosts::default();
    for listener in &model.http {
        let target = if listener.is_secure() {
            &mut hosts.secure
        } else {
            &mut hosts.insecure
        };
        for route in &listener.routes {
            for host in route_hosts(listener, route) {
                target.entry(host.to_string()).or_default().push(route);
            }
        }
    }
    hosts
}

/// Hostnames served over TLS anywhere in the model
fn tls_hostnames(model: &RoutingModel) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    for listener in model.http.iter().filter(|l| l.is_secure()) {
        hosts.insert(listener.hostname_or_wildcard().to_string());
        for route in &listener.routes {
            for host in route_hosts(listener, route) {
                hosts.insert(host.to_string());
            }
        }
    }
    hosts
}

/// Exact matches first, then prefixes longest first, then regexes
fn match_rank(path: &StringMatch) -> (u8, std::cmp::Reverse<usize>) {
    match path {
        StringMatch::Exact(v) => (0, std::cmp::Reverse(v.len())),
        StringMatch::Prefix(v) => (1, std::cmp::Reverse(v.len())),
        StringMatch::Regex(_) => (2, std::cmp::Reverse(0)),
    }
}

fn route_match(path: &StringMatch) -> Value {
    match path {
        StringMatch::Prefix(v) => json!({ "prefix": v }),
        StringMatch::Exact(v) => json!({ "path": v }),
        StringMatch::Regex(v) => json!({ "safeRegex": { "regex": v } }),
    }
}

fn route_action(route: &HttpRoute) -> Value {
    let clusters: Vec<String> = route.backends.iter().map(|b| b.cluster_name()).collect();
    match clusters.as_slice() {
        [] => json!({ "directResponse": { "status": 503 } }),
        [single] => json!({ "route": { "cluster": single } }),
        many => json!({
            "route": {
                "weightedClusters": {
                    "clusters": many
                        .iter()
                        .map(|name| json!({ "name": name, "weight": 1 }))
                        .collect::<Vec<_>>(),
                }
            }
        }),
    }
}

fn domains(host: &str) -> Value {
    if host == WILDCARD_HOSTNAME {
        json!([WILDCARD_HOSTNAME])
    } else {
        json!([host, format!("{host}:*")])
    }
}

fn virtual_host(host: &str, routes: &[&HttpRoute]) -> Value {
    let mut ordered = routes.to_vec();
    ordered.sort_by_key(|r| match_rank(&r.path_match));
    let rendered: Vec<Value> = ordered
        .iter()
        .map(|r| {
            let mut route = route_action(r);
            if let Some(obj) = route.as_object_mut() {
                obj.insert("match".to_string(), route_match(&r.path_match));
            }
            route
        })
        .collect();

    json!({ "name": host, "domains": domains(host), "routes": rendered })
}

fn redirect_virtual_host(host: &str) -> Value {
    json!({
        "name": host,
        "domains": domains(host),
        "routes": [{
            "match": { "prefix": "/" },
            "redirect": { "httpsRedirect": true },
        }],
    })
}

/// Route configurations for the insecure and secure filter chains
pub(crate) fn route_configurations(model: &RoutingModel, enforce_https: bool) -> Vec<Value> {
    let hosts = virtual_hosts(model);
    let tls_hosts = tls_hostnames(model);

    let mut insecure: BTreeMap<String, Value> = hosts
        .insecure
        .iter()
        .map(|(host, routes)| (host.clone(), virtual_host(host, routes)))
        .collect();
    if enforce_https {
        for host in &tls_hosts {
            insecure.insert(host.clone(), redirect_virtual_host(host));
        }
    }

    let mut configs = Vec::new();
    if !insecure.is_empty() {
        configs.push(json!({
            "@type": ROUTE_CONFIG_TYPE,
            "name": INSECURE_ROUTE_CONFIG,
            "virtualHosts": insecure.into_values().collect::<Vec<_>>(),
        }));
    }
    if !hosts.secure.is_empty() {
        configs.push(json!({
            "@type": ROUTE_CONFIG_TYPE,
            "name": SECURE_ROUTE_CONFIG,
            "virtualHosts": hosts
                .secure
                .iter()
                .map(|(host, routes)| virtual_host(host, routes))
                .collect::<Vec<_>>(),
        }));
    }
    configs
}

fn connection_manager(route_config: &str) -> Value {
    json!({
        "name": "envoy.filters.network.http_connection_manager",
        "typedConfig": {
            "@type": HCM_TYPE,
            "statPrefix": route_config,
            "rds": { "routeConfigName": route_config },
            "httpFilters": [{
                "name": "envoy.filters.http.router",
                "typedConfig": { "@type": ROUTER_TYPE },
            }],
        },
    })
}

/// `<secrets-namespace>/<namespace>-<name>`: where synced certificates live
pub(crate) fn secret_name(secrets_namespace: &str, secret: &TlsSecret) -> String {
    format!("{}/{}-{}", secrets_namespace, secret.namespace, secret.name)
}

/// The single listener with one insecure and N secure filter chains
pub(crate) fn listener(model: &RoutingModel, secrets_namespace: &str, has_insecure: bool) -> Value {
    // certificates -> server names
    let mut secure_groups: BTreeMap<Vec<TlsSecret>, BTreeSet<String>> = BTreeMap::new();
    for l in model.http.iter().filter(|l| l.is_secure()) {
        let mut certs = l.tls.clone();
        certs.sort();
        certs.dedup();
        let names = secure_groups.entry(certs).or_default();
        if l.hostname_or_wildcard() != WILDCARD_HOSTNAME {
            names.insert(l.hostname_or_wildcard().to_string());
        }
    }

    let mut chains = Vec::new();
    if has_insecure {
        chains.push(json!({
            "filterChainMatch": { "transportProtocol": "raw_buffer" },
            "filters": [connection_manager(INSECURE_ROUTE_CONFIG)],
        }));
    }
    for (certs, server_names) in &secure_groups {
        let mut chain_match = json!({ "transportProtocol": "tls" });
        if !server_names.is_empty() {
            chain_match["serverNames"] = json!(server_names);
        }
        chains.push(json!({
            "filterChainMatch": chain_match,
            "filters": [connection_manager(SECURE_ROUTE_CONFIG)],
            "transportSocket": {
                "name": "envoy.transport_sockets.tls",
                "typedConfig": {
                    "@type": TLS_CONTEXT_TYPE,
                    "commonTlsContext": {
                        "tlsCertificateSdsSecretConfigs": certs
                            .iter()
                            .map(|c| json!({ "name": secret_name(secrets_namespace, c) }))
                            .collect::<Vec<_>>(),
                    },
                },
            },
        }));
    }

    json!({
        "@type": LISTENER_TYPE,
        "name": LISTENER_NAME,
        "filterChains": chains,
        "listenerFilters": [{
            "name": "envoy.filters.listener.tls_inspector",
            "typedConfig": { "@type": TLS_INSPECTOR_TYPE },
        }],
    })
}

/// One EDS cluster per distinct backend
pub(crate) fn clusters(model: &RoutingModel) -> Vec<Value> {
    model
        .backends()
        .iter()
        .map(|b| {
            let name = b.cluster_name();
            json!({
                "@type": CLUSTER_TYPE,
                "name": name,
                "type": "EDS",
                "connectTimeout": "5s",
                "edsClusterConfig": { "serviceName": name },
            })
        })
        .collect()
}

/// All xDS resources for the model, in a fixed order
pub(crate) fn resources(model: &RoutingModel, secrets_namespace: &str, enforce_https: bool) -> Vec<Value> {
    let route_configs = route_configurations(model, enforce_https);
    let has_insecure = route_configs
        .iter()
        .any(|rc| rc["name"] == INSECURE_ROUTE_CONFIG);

    let mut resources = vec![listener(model, secrets_namespace, has_insecure)];
    resources.extend(route_configs);
    resources.extend(clusters(model));
    resources
}

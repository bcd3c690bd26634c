//! HTTPRoute reconciler
//!
//! Routes carry no derived resources of their own; their content reaches the
//! proxy through the parent Gateway's reconcile. This reconciler only reports
//! per-parent status: `Accepted` and `ResolvedRefs`.

use super::model_builder::GATEWAY_API_GROUP;
use super::predicates::{parent_gateways, GatewayKey};
use crate::apis::conditions::{condition, status_value, ACCEPTED, RESOLVED_REFS};
use crate::apis::metrics::record_reconciliation;
use crate::controller::Context;
use crate::error::Result;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const KIND: &str = "HTTPRoute";

/// Backend Services referenced by `route` as (namespace, name)
///
/// References to kinds other than core `Service` are skipped.
pub fn backend_services(route: &HTTPRoute) -> BTreeSet<(String, String)> {
    let route_namespace = route.namespace().unwrap_or_default();
    route
        .spec
        .rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.backend_refs.as_ref())
        .flatten()
        .filter(|backend| {
            backend.group.as_deref().unwrap_or_default().is_empty()
                && backend.kind.as_deref().unwrap_or("Service") == "Service"
        })
        .map(|backend| {
            (
                backend
                    .namespace
                    .clone()
                    .unwrap_or_else(|| route_namespace.clone()),
                backend.name.clone(),
            )
        })
        .collect()
}

fn parent_ref(key: &GatewayKey) -> Value {
    json!({
        "group": GATEWAY_API_GROUP,
        "kind": "Gateway",
        "namespace": key.namespace,
        "name": key.name,
    })
}

/// Status patch for `route`
///
/// One entry per parent in `parents`. Entries written by other controllers
/// are kept as they are.
pub fn route_status(
    route: &HTTPRoute,
    parents: &[GatewayKey],
    controller_name: &str,
    missing: &[(String, String)],
) -> Value {
    let existing = status_value(route);
    let generation = route.metadata.generation.unwrap_or(0);

    let mut entries: Vec<Value> = existing["parents"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|p| p["controllerName"] != controller_name)
        .cloned()
        .collect();

    let resolved = match missing.first() {
        None => (true, "ResolvedRefs", "Service reference is valid".to_string()),
        Some((namespace, name)) => (
            false,
            "BackendNotFound",
            format!("Service {}/{} not found", namespace, name),
        ),
    };

    for key in parents {
        let previous = existing["parents"]
            .as_array()
            .and_then(|ps| {
                ps.iter().find(|p| {
                    p["controllerName"] == controller_name
                        && p["parentRef"]["name"] == key.name.as_str()
                        && p["parentRef"]["namespace"] == key.namespace.as_str()
                })
            })
            .map(|p| p["conditions"].clone())
            .unwrap_or(Value::Null);

        entries.push(json!({
            "parentRef": parent_ref(key),
            "controllerName": controller_name,
            "conditions": [
                condition(&previous, ACCEPTED, true, "Accepted", "Accepted HTTPRoute", generation),
                condition(&previous, RESOLVED_REFS, resolved.0, resolved.1, &resolved.2, generation),
            ],
        }));
    }

    json!({ "status": { "parents": entries } })
}

fn has_entries_of(route: &HTTPRoute, controller_name: &str) -> bool {
    route
        .status
        .iter()
        .flat_map(|s| &s.parents)
        .any(|p| p.controller_name == controller_name)
}

/// Reconcile a single HTTPRoute
pub async fn reconcile(route: Arc<HTTPRoute>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = route.namespace().unwrap_or_default();
    let name = route.name_any();

    let mut parents = Vec::new();
    for key in parent_gateways(&route) {
        match ctx.client.get_gateway(&key.namespace, &key.name).await? {
            Some(gateway) if ctx.filter.has_matching_controller(&gateway).await => {
                parents.push(key)
            }
            Some(_) => debug!("HTTPRoute {}/{} parent {} is not ours", namespace, name, key),
            None => debug!("HTTPRoute {}/{} parent {} not found", namespace, name, key),
        }
    }

    if parents.is_empty() {
        if has_entries_of(&route, &ctx.config.controller_name) {
            info!(
                "HTTPRoute {}/{} lost its last managed parent, clearing status",
                namespace, name
            );
            let status = route_status(&route, &[], &ctx.config.controller_name, &[]);
            ctx.client
                .patch_http_route_status(&namespace, &name, &status)
                .await?;
        } else {
            debug!(
                "HTTPRoute {}/{} has no parent managed by this controller, ignoring",
                namespace, name
            );
        }
        return Ok(Action::await_change());
    }

    info!("Reconciling HTTPRoute: {}/{}", namespace, name);

    let mut missing = Vec::new();
    for (svc_namespace, svc_name) in backend_services(&route) {
        if ctx.client.get_service(&svc_namespace, &svc_name).await?.is_none() {
            warn!(
                "HTTPRoute {}/{} references missing Service {}/{}",
                namespace, name, svc_namespace, svc_name
            );
            missing.push((svc_namespace, svc_name));
        }
    }

    let status = route_status(&route, &parents, &ctx.config.controller_name, &missing);
    ctx.client
        .patch_http_route_status(&namespace, &name, &status)
        .await?;

    record_reconciliation(KIND, start.elapsed().as_secs_f64(), "success");
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

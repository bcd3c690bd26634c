//! Gateway reconciler
//!
//! Builds the routing model of a Gateway from its attached HTTPRoutes,
//! translates it into one shared CiliumEnvoyConfig + LoadBalancer Service,
//! applies the result and reports status.

use super::model_builder::{attached_route_counts, attached_routes, build_model};
use super::predicates::GatewayKey;
use crate::apis::conditions::{condition, status_value, ACCEPTED, PROGRAMMED, RESOLVED_REFS};
use crate::apis::metrics::record_reconciliation;
use crate::apply::{apply_resources, delete_owned, prune_orphans, OwnerKind};
use crate::client::ClusterClient;
use crate::controller::Context;
use crate::error::{Error, Result};
use crate::translation::{
    DerivedKind, SharedTranslator, Translator, GATEWAY_LABEL_KEY, GATEWAY_PREFIX,
};
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const KIND: &str = "Gateway";

/// Name of the resources derived for a Gateway
pub fn derived_name(gateway_name: &str) -> String {
    format!("{GATEWAY_PREFIX}-{gateway_name}")
}

/// Delete the derived resources owned by `gateway`
///
/// Objects owned by a previous incarnation of the Gateway are left to the
/// orphan pruning.
pub async fn remove_derived(client: &dyn ClusterClient, gateway: &Gateway) -> Result<usize> {
    let namespace = gateway.namespace().unwrap_or_default();
    let uid = gateway.uid().unwrap_or_default();
    let name = derived_name(&gateway.name_any());

    let targets = [
        (DerivedKind::EnvoyConfig, name.clone()),
        (DerivedKind::Endpoints, name.clone()),
        (DerivedKind::Service, name),
    ];
    delete_owned(client, OwnerKind::Gateway, &uid, &namespace, &targets).await
}

/// Addresses assigned to the fronting LoadBalancer service
fn service_addresses(service: Option<&Service>) -> Vec<Value> {
    service
        .and_then(|s| s.status.as_ref())
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| match (&ingress.ip, &ingress.hostname) {
            (Some(ip), _) => Some(json!({ "type": "IPAddress", "value": ip })),
            (None, Some(hostname)) => Some(json!({ "type": "Hostname", "value": hostname })),
            (None, None) => None,
        })
        .collect()
}

/// Status patch for a Gateway
///
/// `programmed` carries the failure message when translation or apply did
/// not succeed.
pub fn gateway_status(
    gateway: &Gateway,
    listener_routes: &[(String, usize)],
    addresses: Vec<Value>,
    programmed: std::result::Result<(), String>,
) -> Value {
    let existing = status_value(gateway);
    let generation = gateway.metadata.generation.unwrap_or(0);

    let programmed_condition = match &programmed {
        Ok(()) => condition(
            &existing["conditions"],
            PROGRAMMED,
            true,
            "Programmed",
            "Gateway is programmed",
            generation,
        ),
        Err(message) => condition(
            &existing["conditions"],
            PROGRAMMED,
            false,
            "Invalid",
            message,
            generation,
        ),
    };

    let listeners: Vec<Value> = listener_routes
        .iter()
        .map(|(name, attached)| {
            let previous = existing["listeners"]
                .as_array()
                .and_then(|ls| ls.iter().find(|l| l["name"] == name.as_str()))
                .map(|l| l["conditions"].clone())
                .unwrap_or(Value::Null);
            json!({
                "name": name,
                "attachedRoutes": attached,
                "supportedKinds": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "HTTPRoute"
                }],
                "conditions": [
                    condition(&previous, ACCEPTED, true, "Accepted", "Listener is accepted", generation),
                    condition(
                        &previous,
                        PROGRAMMED,
                        programmed.is_ok(),
                        if programmed.is_ok() { "Programmed" } else { "Invalid" },
                        if programmed.is_ok() { "Listener is programmed" } else { "Listener is not programmed" },
                        generation,
                    ),
                    condition(&previous, RESOLVED_REFS, true, "ResolvedRefs", "All references resolved", generation),
                ],
            })
        })
        .collect();

    let status = json!({
        "conditions": [
            condition(
                &existing["conditions"],
                ACCEPTED,
                true,
                "Accepted",
                "Gateway is accepted",
                generation,
            ),
            programmed_condition,
        ],
        "listeners": listeners,
        "addresses": addresses,
    });

    json!({ "status": status })
}

/// Reconcile a single Gateway
pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let key = GatewayKey::of(&gateway);

    if !ctx.filter.controls(&gateway).await? {
        let deleted = remove_derived(ctx.client.as_ref(), &gateway).await?;
        if deleted > 0 {
            info!(
                "Gateway {} is no longer managed by this controller, removed {} derived resource(s)",
                key, deleted
            );
        } else {
            debug!("Gateway {} is not managed by this controller, ignoring", key);
        }
        return Ok(Action::await_change());
    }

    info!("Reconciling Gateway: {}", key);

    let routes = ctx.client.list_http_routes().await?;
    let attached = attached_routes(&gateway, &routes);
    debug!("Gateway {} has {} attached HTTPRoute(s)", key, attached.len());

    let model = build_model(&gateway, &routes);
    let counts = attached_route_counts(&gateway, &routes);
    let name = derived_name(&key.name);
    // HTTPS enforcement is an Ingress setting
    let translator = SharedTranslator::new(&name, &key.namespace, &ctx.config.secrets_namespace, false)
        .with_label_key(GATEWAY_LABEL_KEY);

    let resources = match translator.translate(&model) {
        Ok(resources) => resources,
        Err(e) => {
            warn!("Gateway {} cannot be translated: {}", key, e);
            let status = gateway_status(&gateway, &counts, Vec::new(), Err(e.to_string()));
            ctx.client
                .patch_gateway_status(&key.namespace, &key.name, &status)
                .await?;
            record_reconciliation(KIND, start.elapsed().as_secs_f64(), "translation_error");
            return Err(Error::Translation(e));
        }
    };

    apply_resources(ctx.client.as_ref(), resources).await?;
    prune_orphans(
        ctx.client.as_ref(),
        GATEWAY_LABEL_KEY,
        OwnerKind::Gateway,
        Some(&key.namespace),
    )
    .await?;

    let service = ctx.client.get_service(&key.namespace, &name).await?;
    let status = gateway_status(&gateway, &counts, service_addresses(service.as_ref()), Ok(()));
    ctx.client
        .patch_gateway_status(&key.namespace, &key.name, &status)
        .await?;

    info!(
        "Gateway {} programmed with {} listener(s)",
        key,
        model.http.len()
    );
    record_reconciliation(KIND, start.elapsed().as_secs_f64(), "success");
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

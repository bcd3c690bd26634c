//! Ingress reconciler
//!
//! Each Ingress of the configured class gets a dedicated load balancer: its
//! own CiliumEnvoyConfig, Service and Endpoints. The Service address is
//! reported back on the Ingress status.

use super::ingestion::{build_model, ingress_class};
use crate::apis::conditions::status_value;
use crate::apis::events::{Change, EventKind};
use crate::apis::gateway::predicates::spec_changed;
use crate::apis::metrics::{record_filter_drop, record_reconciliation};
use crate::apply::{apply_resources, delete_owned, prune_orphans, OwnerKind};
use crate::client::ClusterClient;
use crate::controller::Context;
use crate::error::Result;
use crate::translation::{DedicatedTranslator, DerivedKind, Translator, INGRESS_LABEL_KEY};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const KIND: &str = "Ingress";

/// True when a watch change should trigger an Ingress reconcile.
///
/// Changes of Ingresses that are, or were, of `class_name` pass unless only
/// their status moved. The old class matters so that a class switch still
/// reaches the reconciler and its derived resources get removed.
pub fn accept_change(change: &Change<Ingress>, class_name: &str) -> bool {
    let was_ours = change
        .old
        .as_deref()
        .is_some_and(|old| ingress_class(old) == Some(class_name));
    let is_ours = ingress_class(&change.new) == Some(class_name);
    if !was_ours && !is_ours {
        record_filter_drop(KIND, "foreign_controller");
        return false;
    }

    if change.kind == EventKind::Update {
        if let Some(old) = change.old.as_deref() {
            if !spec_changed(old, &*change.new) {
                record_filter_drop(KIND, "status_only");
                return false;
            }
        }
    }
    true
}

/// Load balancer addresses of `service`, in Ingress status form
fn load_balancer_ingress(service: Option<&Service>) -> Vec<Value> {
    service
        .and_then(|s| s.status.as_ref())
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| match (&ingress.ip, &ingress.hostname) {
            (Some(ip), _) => Some(json!({ "ip": ip })),
            (None, Some(hostname)) => Some(json!({ "hostname": hostname })),
            (None, None) => None,
        })
        .collect()
}

/// Delete the derived resources owned by `ingress`
///
/// Objects owned by another Ingress of the same name (a previous
/// incarnation with a different uid) are left to the orphan pruning.
pub async fn remove_derived(client: &dyn ClusterClient, ingress: &Ingress) -> Result<usize> {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let uid = ingress.uid().unwrap_or_default();

    let targets = [
        (DerivedKind::EnvoyConfig, DedicatedTranslator::envoy_config_name(&namespace, &name)),
        (DerivedKind::Endpoints, DedicatedTranslator::service_name(&name)),
        (DerivedKind::Service, DedicatedTranslator::service_name(&name)),
    ];
    delete_owned(client, OwnerKind::Ingress, &uid, &namespace, &targets).await
}

/// Reconcile a single Ingress
pub async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let class_name = &ctx.config.ingress.class_name;

    if ingress_class(&ingress) != Some(class_name.as_str()) {
        let deleted = remove_derived(ctx.client.as_ref(), &ingress).await?;
        if deleted > 0 {
            info!(
                "Ingress {}/{} left class {}, removed {} derived resource(s)",
                namespace, name, class_name, deleted
            );
        }
        return Ok(Action::await_change());
    }

    info!("Reconciling Ingress: {}/{}", namespace, name);

    let model = build_model(&ingress);
    if model.is_empty() {
        warn!("Ingress {}/{} has no usable rules or default backend", namespace, name);
        remove_derived(ctx.client.as_ref(), &ingress).await?;
        record_reconciliation(KIND, start.elapsed().as_secs_f64(), "empty");
        return Ok(Action::await_change());
    }

    let translator =
        DedicatedTranslator::new(&ctx.config.secrets_namespace, ctx.config.enforce_https);
    let resources = translator.translate(&model)?;
    apply_resources(ctx.client.as_ref(), resources).await?;
    prune_orphans(
        ctx.client.as_ref(),
        INGRESS_LABEL_KEY,
        OwnerKind::Ingress,
        Some(&namespace),
    )
    .await?;

    let service = ctx
        .client
        .get_service(&namespace, &DedicatedTranslator::service_name(&name))
        .await?;
    let addresses = load_balancer_ingress(service.as_ref());
    let current = status_value(&*ingress);
    let current = current["loadBalancer"]["ingress"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    if addresses.is_empty() {
        debug!("Ingress {}/{} has no load balancer address yet", namespace, name);
    } else if addresses != current {
        let status = json!({ "status": { "loadBalancer": { "ingress": addresses } } });
        ctx.client
            .patch_ingress_status(&namespace, &name, &status)
            .await?;
        info!("Updated load balancer status of Ingress {}/{}", namespace, name);
    }

    record_reconciliation(KIND, start.elapsed().as_secs_f64(), "success");
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

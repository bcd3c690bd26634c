//! Change-relevance filter
//!
//! Decides per watch event whether a resource belongs to this controller and
//! whether the change is worth a reconcile. Also maps Secrets and HTTPRoutes
//! back to the Gateways that depend on them.

use crate::apis::events::{EventKind, RoutingObject};
use crate::apis::metrics::record_filter_drop;
use crate::client::ClusterClient;
use crate::error::Error;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata fields whose change is meaningful to a reconcile. Everything
/// else (resourceVersion, managedFields, ...) is maintained by the server.
const RELEVANT_METADATA: [&str; 5] = [
    "generation",
    "labels",
    "annotations",
    "deletionTimestamp",
    "finalizers",
];

/// Key for Gateway lookup: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayKey {
    pub namespace: String,
    pub name: String,
}

impl GatewayKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(gateway: &Gateway) -> Self {
        Self::new(gateway.namespace().unwrap_or_default(), gateway.name_any())
    }

    pub fn object_ref(&self) -> ObjectRef<Gateway> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Accept/reject decisions for watch events
#[derive(Clone)]
pub struct ChangeFilter {
    client: Arc<dyn ClusterClient>,
    controller_name: String,
}

impl ChangeFilter {
    pub fn new(client: Arc<dyn ClusterClient>, controller_name: impl Into<String>) -> Self {
        Self {
            client,
            controller_name: controller_name.into(),
        }
    }

    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    /// Decide whether an event should trigger a reconcile.
    ///
    /// `old` is only consulted for updates; a variant mismatch between `old`
    /// and `new` is rejected.
    pub async fn accept(
        &self,
        kind: EventKind,
        old: Option<&RoutingObject>,
        new: &RoutingObject,
    ) -> bool {
        let old = if kind == EventKind::Update { old } else { None };

        if let Some(old) = old {
            match updated_portion(old, new) {
                None => return self.drop_event(new, "kind_mismatch"),
                Some(Portion { spec, status }) => {
                    if !spec {
                        if status {
                            debug!("{} {} changed status only", new.kind(), new.key());
                        }
                        return self.drop_event(new, "status_only");
                    }
                }
            }
        }

        let accepted = match new {
            RoutingObject::GatewayClass(class) => {
                let old_ours = matches!(
                    old,
                    Some(RoutingObject::GatewayClass(o)) if self.owns_class(o)
                );
                old_ours || self.owns_class(class)
            }
            RoutingObject::Gateway(gateway) => {
                let old_ours = match old {
                    Some(RoutingObject::Gateway(o)) => self.has_matching_controller(o).await,
                    _ => false,
                };
                old_ours || self.has_matching_controller(gateway).await
            }
            RoutingObject::HttpRoute(_) | RoutingObject::Secret(_) => true,
        };

        if accepted {
            debug!("Accepted {} event for {} {}", kind, new.kind(), new.key());
            true
        } else {
            self.drop_event(new, "foreign_controller")
        }
    }

    fn drop_event(&self, object: &RoutingObject, reason: &str) -> bool {
        record_filter_drop(object.kind(), reason);
        false
    }

    fn owns_class(&self, class: &GatewayClass) -> bool {
        class.spec.controller_name == self.controller_name
    }

    /// True when the Gateway's class names this controller.
    ///
    /// A missing class or failed read logs a warning and rejects.
    pub async fn has_matching_controller(&self, gateway: &Gateway) -> bool {
        self.controls(gateway).await.unwrap_or_else(|e| {
            warn!(
                "Unable to get GatewayClass {}: {}",
                gateway.spec.gateway_class_name, e
            );
            false
        })
    }

    /// Like [`Self::has_matching_controller`], but a failed read is returned
    pub async fn controls(&self, gateway: &Gateway) -> Result<bool, Error> {
        let class_name = &gateway.spec.gateway_class_name;
        match self.client.get_gateway_class(class_name).await? {
            Some(class) => Ok(self.owns_class(&class)),
            None => {
                warn!(
                    "GatewayClass {} referenced by Gateway {} not found",
                    class_name,
                    GatewayKey::of(gateway)
                );
                Ok(false)
            }
        }
    }

    /// Gateways whose listeners reference `secret` as a TLS certificate.
    ///
    /// Returns an empty list (and logs a warning) when Gateways cannot be
    /// listed.
    pub async fn gateways_for_secret(&self, secret: &Secret) -> Vec<GatewayKey> {
        let secret_name = secret.name_any();
        let secret_namespace = secret.namespace().unwrap_or_default();

        let gateways = match self.client.list_gateways().await {
            Ok(gateways) => gateways,
            Err(e) => {
                warn!("Unable to list Gateways for Secret {}: {}", secret_name, e);
                return Vec::new();
            }
        };

        let mut keys = BTreeSet::new();
        for gateway in &gateways {
            let gateway_namespace = gateway.namespace().unwrap_or_default();
            let cert_refs = gateway
                .spec
                .listeners
                .iter()
                .filter_map(|l| l.tls.as_ref())
                .filter_map(|tls| tls.certificate_refs.as_ref())
                .flatten();

            for cert in cert_refs {
                if !is_secret_ref(cert.group.as_deref(), cert.kind.as_deref()) {
                    continue;
                }
                let namespace = cert.namespace.as_deref().unwrap_or(&gateway_namespace);
                if cert.name == secret_name && namespace == secret_namespace {
                    keys.insert(GatewayKey::of(gateway));
                }
            }
        }
        keys.into_iter().collect()
    }
}

/// Reference points at a core `Secret`; unset group and kind default to it
pub fn is_secret_ref(group: Option<&str>, kind: Option<&str>) -> bool {
    group.unwrap_or("").is_empty() && kind.unwrap_or("Secret") == "Secret"
}

/// Gateways a route attaches to. Non-Gateway parents are skipped.
pub fn parent_gateways(route: &HTTPRoute) -> Vec<GatewayKey> {
    let route_namespace = route.namespace().unwrap_or_default();
    route
        .spec
        .parent_refs
        .iter()
        .flatten()
        .filter(|p| {
            p.group.as_deref().unwrap_or("gateway.networking.k8s.io") == "gateway.networking.k8s.io"
                && p.kind.as_deref().unwrap_or("Gateway") == "Gateway"
        })
        .map(|p| {
            GatewayKey::new(
                p.namespace.clone().unwrap_or_else(|| route_namespace.clone()),
                p.name.clone(),
            )
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

struct Portion {
    spec: bool,
    status: bool,
}

fn updated_portion(old: &RoutingObject, new: &RoutingObject) -> Option<Portion> {
    fn portion<K: Serialize>(old: &K, new: &K) -> Portion {
        Portion {
            spec: spec_changed(old, new),
            status: status_changed(old, new),
        }
    }

    match (old, new) {
        (RoutingObject::GatewayClass(o), RoutingObject::GatewayClass(n)) => Some(portion(&**o, &**n)),
        (RoutingObject::Gateway(o), RoutingObject::Gateway(n)) => Some(portion(&**o, &**n)),
        (RoutingObject::HttpRoute(o), RoutingObject::HttpRoute(n)) => Some(portion(&**o, &**n)),
        // Secrets have no status subresource; any update counts
        (RoutingObject::Secret(_), RoutingObject::Secret(_)) => Some(Portion {
            spec: true,
            status: false,
        }),
        _ => None,
    }
}

fn relevant_portion<K: Serialize>(object: &K) -> Option<Value> {
    let mut value = serde_json::to_value(object).ok()?;
    let map = value.as_object_mut()?;
    map.remove("status");
    if let Some(Value::Object(meta)) = map.get_mut("metadata") {
        meta.retain(|k, _| RELEVANT_METADATA.contains(&k.as_str()));
    }
    Some(value)
}

fn status_of<K: Serialize>(object: &K) -> Option<Value> {
    serde_json::to_value(object)
        .ok()?
        .as_object_mut()?
        .remove("status")
}

/// True when anything but status and server-managed metadata differs.
/// Objects that fail to serialize count as changed.
pub fn spec_changed<K: Serialize>(old: &K, new: &K) -> bool {
    match (relevant_portion(old), relevant_portion(new)) {
        (Some(o), Some(n)) => o != n,
        _ => true,
    }
}

/// True when the status subresource differs
pub fn status_changed<K: Serialize>(old: &K, new: &K) -> bool {
    status_of(old) != status_of(new)
}

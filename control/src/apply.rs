//! Diff-apply of derived resources
//!
//! Derived objects are written only when their managed portion differs from
//! the live object. Replacements start from the live object so that fields
//! allocated by the API server (Service `clusterIP`, `nodePort`s) survive.

use crate::apis::metrics::record_derived_write;
use crate::client::ClusterClient;
use crate::error::Result;
use crate::translation::{managed_selector, DerivedKind, DerivedObject, DerivedResources};
use k8s_openapi::api::core::v1::{EndpointSubset, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// What a single apply did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

impl ApplyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Created => "created",
            ApplyAction::Updated => "updated",
            ApplyAction::Unchanged => "unchanged",
        }
    }
}

/// Kind of resource that owns derived objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Gateway,
    Ingress,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Gateway => "Gateway",
            OwnerKind::Ingress => "Ingress",
        }
    }
}

/// Apply one translation output, Service first
pub async fn apply_resources(
    client: &dyn ClusterClient,
    resources: DerivedResources,
) -> Result<Vec<ApplyAction>> {
    let mut actions = Vec::with_capacity(3);
    for object in resources.into_objects() {
        actions.push(apply_object(client, object).await?);
    }
    Ok(actions)
}

/// Create `desired` if absent, replace it if its managed portion drifted
pub async fn apply_object(client: &dyn ClusterClient, desired: DerivedObject) -> Result<ApplyAction> {
    let kind = desired.kind();
    let live = client
        .get_derived(kind, desired.namespace(), desired.name())
        .await?;

    let action = match live {
        None => {
            client.create_derived(&desired).await?;
            info!("Created {} {}", kind.as_str(), desired.key());
            ApplyAction::Created
        }
        Some(live) if !needs_update(&live, &desired) => {
            debug!("{} {} is up to date", kind.as_str(), desired.key());
            ApplyAction::Unchanged
        }
        Some(live) => {
            let merged = merge_into_live(live, desired);
            client.replace_derived(&merged).await?;
            info!("Updated {} {}", kind.as_str(), merged.key());
            ApplyAction::Updated
        }
    };

    record_derived_write(kind.as_str(), action.as_str());
    Ok(action)
}

fn labels_subset(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let live_labels = live.labels.as_ref();
    desired.labels.iter().flatten().all(|(k, v)| {
        live_labels
            .and_then(|labels| labels.get(k))
            .is_some_and(|live_v| live_v == v)
    })
}

fn port_signature(ports: Option<&Vec<ServicePort>>) -> Vec<(Option<String>, String, i32)> {
    ports
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                p.port,
            )
        })
        .collect()
}

type SubsetSignature = (BTreeSet<String>, BTreeSet<(Option<String>, i32)>);

fn subset_signature(subsets: Option<&Vec<EndpointSubset>>) -> Vec<SubsetSignature> {
    subsets
        .into_iter()
        .flatten()
        .map(|s| {
            let ips = s.addresses.iter().flatten().map(|a| a.ip.clone()).collect();
            let ports = s
                .ports
                .iter()
                .flatten()
                .map(|p| (p.name.clone(), p.port))
                .collect();
            (ips, ports)
        })
        .collect()
}

/// True when the managed portion of `live` differs from `desired`
pub fn needs_update(live: &DerivedObject, desired: &DerivedObject) -> bool {
    if !labels_subset(live.meta(), desired.meta())
        || live.meta().owner_references != desired.meta().owner_references
    {
        return true;
    }

    match (live, desired) {
        (DerivedObject::EnvoyConfig(l), DerivedObject::EnvoyConfig(d)) => l.spec != d.spec,
        (DerivedObject::Service(l), DerivedObject::Service(d)) => {
            let live_spec = l.spec.as_ref();
            let desired_spec = d.spec.as_ref();
            live_spec.and_then(|s| s.type_.as_deref()) != desired_spec.and_then(|s| s.type_.as_deref())
                || port_signature(live_spec.and_then(|s| s.ports.as_ref()))
                    != port_signature(desired_spec.and_then(|s| s.ports.as_ref()))
        }
        (DerivedObject::Endpoints(l), DerivedObject::Endpoints(d)) => {
            subset_signature(l.subsets.as_ref()) != subset_signature(d.subsets.as_ref())
        }
        _ => true,
    }
}

fn merge_meta(live: &ObjectMeta, desired: ObjectMeta) -> ObjectMeta {
    let mut meta = live.clone();
    let mut labels = live.labels.clone().unwrap_or_default();
    labels.extend(desired.labels.unwrap_or_default());
    meta.labels = Some(labels);
    meta.owner_references = desired.owner_references;
    meta.managed_fields = None;
    meta
}

/// Desired state layered over the live object, keeping the live
/// resourceVersion and server-allocated Service fields
pub fn merge_into_live(live: DerivedObject, desired: DerivedObject) -> DerivedObject {
    match (live, desired) {
        (DerivedObject::EnvoyConfig(l), DerivedObject::EnvoyConfig(mut d)) => {
            d.metadata = merge_meta(&l.metadata, d.metadata);
            DerivedObject::EnvoyConfig(d)
        }
        (DerivedObject::Service(l), DerivedObject::Service(mut d)) => {
            d.metadata = merge_meta(&l.metadata, d.metadata);
            let desired_spec = d.spec.take().unwrap_or_default();
            let mut spec = l.spec.unwrap_or_default();
            let live_ports = spec.ports.take().unwrap_or_default();
            let ports = desired_spec
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|mut port| {
                    port.node_port = live_ports
                        .iter()
                        .find(|p| p.port == port.port && p.protocol == port.protocol)
                        .and_then(|p| p.node_port);
                    port
                })
                .collect();
            spec.type_ = desired_spec.type_;
            spec.ports = Some(ports);
            d.spec = Some(spec);
            d.status = l.status;
            DerivedObject::Service(d)
        }
        (DerivedObject::Endpoints(l), DerivedObject::Endpoints(mut d)) => {
            d.metadata = merge_meta(&l.metadata, d.metadata);
            DerivedObject::Endpoints(d)
        }
        (_, desired) => desired,
    }
}

async fn owner_exists(
    client: &dyn ClusterClient,
    owner_kind: OwnerKind,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<bool> {
    let uid = match owner_kind {
        OwnerKind::Gateway => client
            .get_gateway(namespace, &owner.name)
            .await?
            .and_then(|g| g.metadata.uid),
        OwnerKind::Ingress => client
            .get_ingress(namespace, &owner.name)
            .await?
            .and_then(|i| i.metadata.uid),
    };
    Ok(uid.as_deref() == Some(owner.uid.as_str()))
}

/// Delete managed objects whose owning Gateway or Ingress is gone.
///
/// Objects labelled with `label_key` are considered, optionally limited to
/// one namespace. An owner that was recreated (same name, new uid) counts as
/// gone. Returns the number of deleted objects.
pub async fn prune_orphans(
    client: &dyn ClusterClient,
    label_key: &str,
    owner_kind: OwnerKind,
    namespace: Option<&str>,
) -> Result<usize> {
    let selector = managed_selector(label_key);
    let mut deleted = 0;

    for kind in DerivedKind::ALL {
        for object in client.list_derived(kind, &selector).await? {
            if namespace.is_some_and(|ns| ns != object.namespace()) {
                continue;
            }
            let Some(owner) = object
                .owner_references()
                .iter()
                .find(|o| o.kind == owner_kind.as_str())
            else {
                continue;
            };
            if owner_exists(client, owner_kind, object.namespace(), owner).await? {
                continue;
            }

            client
                .delete_derived(kind, object.namespace(), object.name())
                .await?;
            info!(
                "Deleted orphaned {} {} ({} {} is gone)",
                kind.as_str(),
                object.key(),
                owner_kind.as_str(),
                owner.name
            );
            record_derived_write(kind.as_str(), "deleted");
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Delete the named derived objects that `owner_kind` with `uid` owns.
///
/// Objects that are missing or owned by another incarnation are left alone.
/// Returns the number of deleted objects.
pub async fn delete_owned(
    client: &dyn ClusterClient,
    owner_kind: OwnerKind,
    uid: &str,
    namespace: &str,
    targets: &[(DerivedKind, String)],
) -> Result<usize> {
    let mut deleted = 0;
    for (kind, name) in targets {
        let Some(object) = client.get_derived(*kind, namespace, name).await? else {
            continue;
        };
        let owned = object
            .owner_references()
            .iter()
            .any(|o| o.kind == owner_kind.as_str() && o.uid == uid);
        if !owned {
            continue;
        }
        client.delete_derived(*kind, namespace, name).await?;
        info!("Deleted {} {}/{}", kind.as_str(), namespace, name);
        record_derived_write(kind.as_str(), "deleted");
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::error::Error;
    use crate::translation::{
        DedicatedTranslator, SharedTranslator, Translator, GATEWAY_LABEL_KEY, INGRESS_LABEL_KEY,
    };
    use common::{FullyQualifiedResource, HttpListener, RoutingModel};
    use gateway_api::apis::standard::gateways::Gateway;
    use k8s_openapi::api::core::v1::Service;
    use std::sync::{Arc, Mutex};

    fn model(kind: &str, uid: &str) -> RoutingModel {
        RoutingModel::new(vec![HttpListener {
            name: "http".to_string(),
            sources: vec![FullyQualifiedResource {
                name: "web".to_string(),
                namespace: "default".to_string(),
                group: "gateway.networking.k8s.io".to_string(),
                version: "v1".to_string(),
                kind: kind.to_string(),
                uid: uid.to_string(),
            }],
            port: 80,
            hostname: "*".to_string(),
            ..Default::default()
        }])
    }

    fn derived() -> DerivedResources {
        SharedTranslator::new("cilium-gateway-web", "default", "cilium-secrets", false)
            .translate(&model("Gateway", "uid-1"))
            .expect("translate")
    }

    fn service() -> DerivedObject {
        derived().into_objects().remove(0)
    }

    fn live_copy(object: &DerivedObject) -> DerivedObject {
        let mut live = object.clone();
        live.meta_mut().resource_version = Some("7".to_string());
        live.meta_mut().uid = Some("live-uid".to_string());
        live
    }

    #[tokio::test]
    async fn test_absent_object_is_created() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_derived().returning(|_, _, _| Ok(None));
        mock.expect_create_derived().times(1).returning(|_| Ok(()));
        mock.expect_replace_derived().never();

        let action = apply_object(&mock, service()).await.expect("apply");
        assert_eq!(action, ApplyAction::Created);
    }

    #[tokio::test]
    async fn test_identical_object_is_not_written() {
        let desired = service();
        let live = live_copy(&desired);

        let mut mock = MockClusterClient::new();
        mock.expect_get_derived()
            .returning(move |_, _, _| Ok(Some(live.clone())));
        mock.expect_create_derived().never();
        mock.expect_replace_derived().never();

        let action = apply_object(&mock, desired).await.expect("apply");
        assert_eq!(action, ApplyAction::Unchanged);
    }

    #[tokio::test]
    async fn test_apply_resources_twice_writes_once() {
        let store: Arc<Mutex<Vec<DerivedObject>>> = Arc::new(Mutex::new(Vec::new()));

        let mut mock = MockClusterClient::new();
        let reader = store.clone();
        mock.expect_get_derived().returning(move |kind, ns, name| {
            Ok(reader
                .lock()
                .expect("lock")
                .iter()
                .find(|o| o.kind() == kind && o.namespace() == ns && o.name() == name)
                .cloned())
        });
        let writer = store.clone();
        mock.expect_create_derived().times(3).returning(move |o| {
            writer.lock().expect("lock").push(o.clone());
            Ok(())
        });
        mock.expect_replace_derived().never();

        let first = apply_resources(&mock, derived()).await.expect("apply");
        assert_eq!(first, vec![ApplyAction::Created; 3]);
        let second = apply_resources(&mock, derived()).await.expect("apply");
        assert_eq!(second, vec![ApplyAction::Unchanged; 3]);
    }

    #[tokio::test]
    async fn test_drifted_service_replaced_keeping_server_fields() {
        let desired = service();
        let mut live = live_copy(&desired);
        if let DerivedObject::Service(Service { spec: Some(spec), .. }) = &mut live {
            spec.cluster_ip = Some("10.0.0.12".to_string());
            spec.type_ = Some("ClusterIP".to_string());
            if let Some(ports) = spec.ports.as_mut() {
                ports[0].node_port = Some(31080);
            }
        }

        let mut mock = MockClusterClient::new();
        mock.expect_get_derived()
            .returning(move |_, _, _| Ok(Some(live.clone())));
        mock.expect_replace_derived()
            .times(1)
            .withf(|object| {
                let DerivedObject::Service(svc) = object else {
                    return false;
                };
                let spec = svc.spec.as_ref();
                svc.metadata.resource_version.as_deref() == Some("7")
                    && spec.and_then(|s| s.cluster_ip.as_deref()) == Some("10.0.0.12")
                    && spec.and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
                    && spec
                        .and_then(|s| s.ports.as_ref())
                        .map(|p| p[0].node_port)
                        == Some(Some(31080))
            })
            .returning(|_| Ok(()));

        let action = apply_object(&mock, desired).await.expect("apply");
        assert_eq!(action, ApplyAction::Updated);
    }

    #[tokio::test]
    async fn test_conflict_surfaces() {
        let desired = service();
        let mut live = live_copy(&desired);
        live.meta_mut().owner_references = None;

        let mut mock = MockClusterClient::new();
        mock.expect_get_derived()
            .returning(move |_, _, _| Ok(Some(live.clone())));
        mock.expect_replace_derived().returning(|o| {
            Err(Error::Conflict {
                kind: "Service",
                key: o.key(),
            })
        });

        let err = apply_object(&mock, desired).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_extra_live_labels_are_not_drift() {
        let desired = service();
        let mut live = live_copy(&desired);
        live.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "edge".to_string());

        assert!(!needs_update(&live, &desired));

        let merged = merge_into_live(live, desired);
        let labels = merged.meta().labels.clone().unwrap_or_default();
        assert!(labels.contains_key("team"));
        assert!(labels.contains_key(GATEWAY_LABEL_KEY));
    }

    #[test]
    fn test_endpoints_port_protocol_default_is_not_drift() {
        let objects = derived().into_objects();
        let desired = objects[1].clone();
        let mut live = live_copy(&desired);
        if let DerivedObject::Endpoints(ep) = &mut live {
            if let Some(subsets) = ep.subsets.as_mut() {
                if let Some(ports) = subsets[0].ports.as_mut() {
                    ports[0].protocol = Some("TCP".to_string());
                }
            }
        }
        assert!(!needs_update(&live, &desired));
    }

    fn gateway_with_uid(uid: &str) -> Gateway {
        let mut gw = Gateway {
            metadata: Default::default(),
            spec: Default::default(),
            status: None,
        };
        gw.metadata.name = Some("web".to_string());
        gw.metadata.namespace = Some("default".to_string());
        gw.metadata.uid = Some(uid.to_string());
        gw
    }

    #[tokio::test]
    async fn test_prune_deletes_when_owner_gone() {
        let objects = derived().into_objects();

        let mut mock = MockClusterClient::new();
        mock.expect_list_derived()
            .returning(move |kind, _| Ok(objects.iter().filter(|o| o.kind() == kind).cloned().collect()));
        mock.expect_get_gateway().returning(|_, _| Ok(None));
        mock.expect_delete_derived().times(3).returning(|_, _, _| Ok(()));

        let deleted = prune_orphans(&mock, GATEWAY_LABEL_KEY, OwnerKind::Gateway, None)
            .await
            .expect("prune");
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn test_prune_keeps_objects_of_live_owner() {
        let objects = derived().into_objects();

        let mut mock = MockClusterClient::new();
        mock.expect_list_derived()
            .returning(move |kind, _| Ok(objects.iter().filter(|o| o.kind() == kind).cloned().collect()));
        mock.expect_get_gateway()
            .returning(|_, _| Ok(Some(gateway_with_uid("uid-1"))));
        mock.expect_delete_derived().never();

        let deleted = prune_orphans(&mock, GATEWAY_LABEL_KEY, OwnerKind::Gateway, Some("default"))
            .await
            .expect("prune");
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_prune_treats_recreated_owner_as_gone() {
        let objects = derived().into_objects();

        let mut mock = MockClusterClient::new();
        mock.expect_list_derived()
            .returning(move |kind, _| Ok(objects.iter().filter(|o| o.kind() == kind).cloned().collect()));
        mock.expect_get_gateway()
            .returning(|_, _| Ok(Some(gateway_with_uid("uid-2"))));
        mock.expect_delete_derived().times(3).returning(|_, _, _| Ok(()));

        let deleted = prune_orphans(&mock, GATEWAY_LABEL_KEY, OwnerKind::Gateway, None)
            .await
            .expect("prune");
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn test_prune_skips_other_namespaces_and_owner_kinds() {
        let ingress_objects = DedicatedTranslator::new("cilium-secrets", false)
            .translate(&model("Ingress", "uid-9"))
            .expect("translate")
            .into_objects();

        let mut mock = MockClusterClient::new();
        mock.expect_list_derived().returning(move |kind, _| {
            Ok(ingress_objects
                .iter()
                .filter(|o| o.kind() == kind)
                .cloned()
                .collect())
        });
        mock.expect_get_ingress().never();
        mock.expect_delete_derived().never();

        let deleted = prune_orphans(&mock, INGRESS_LABEL_KEY, OwnerKind::Ingress, Some("other"))
            .await
            .expect("prune");
        assert_eq!(deleted, 0);

        let deleted = prune_orphans(&mock, INGRESS_LABEL_KEY, OwnerKind::Gateway, None)
            .await
            .expect("prune");
        assert_eq!(deleted, 0);
    }
}

//! Cluster access
//!
//! Every read and write the reconcilers and the change filter perform goes
//! through [`ClusterClient`]. Production wraps a single `kube::Client`
//! ([`KubeClusterClient`]); tests substitute `MockClusterClient`.

use crate::apis::cilium::CiliumEnvoyConfig;
use crate::error::Error;
use crate::translation::{DerivedKind, DerivedObject};
use async_trait::async_trait;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;

#[cfg(test)]
use mockall::automock;

/// Field manager recorded on every status patch
pub const FIELD_MANAGER: &str = "cilium-gateway-controller";

/// Trait abstracting the cluster API
///
/// Lookups return `Ok(None)` when the object does not exist; any other
/// failure is an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>, Error>;

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>, Error>;

    /// All Gateways in all namespaces
    async fn list_gateways(&self) -> Result<Vec<Gateway>, Error>;

    /// All HTTPRoutes in all namespaces
    async fn list_http_routes(&self) -> Result<Vec<HTTPRoute>, Error>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    async fn get_derived(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DerivedObject>, Error>;

    /// Derived objects of `kind` in all namespaces matching a label selector
    async fn list_derived(
        &self,
        kind: DerivedKind,
        label_selector: &str,
    ) -> Result<Vec<DerivedObject>, Error>;

    async fn create_derived(&self, object: &DerivedObject) -> Result<(), Error>;

    /// Full replace; `object` must carry the live resourceVersion
    async fn replace_derived(&self, object: &DerivedObject) -> Result<(), Error>;

    /// Delete a derived object; an already missing object is not an error
    async fn delete_derived(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;

    async fn patch_gateway_class_status(&self, name: &str, status: &Value) -> Result<(), Error>;

    async fn patch_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error>;

    async fn patch_http_route_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error>;

    async fn patch_ingress_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error>;
}

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn all<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

fn key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

async fn get_opt<K>(api: Api<K>, kind: &'static str, namespace: &str, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(name)
        .await
        .map_err(|e| Error::lookup(kind, key(namespace, name), e))
}

async fn list_all<K>(api: Api<K>, kind: &'static str, params: &ListParams) -> Result<Vec<K>, Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.list(params)
        .await
        .map(|list| list.items)
        .map_err(|e| Error::lookup(kind, "*", e))
}

async fn create<K>(api: Api<K>, kind: &'static str, object: &K, object_key: String) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| Error::from_write(kind, object_key, e))
}

async fn replace<K>(
    api: Api<K>,
    kind: &'static str,
    name: &str,
    object: &K,
    object_key: String,
) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.replace(name, &PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| Error::from_write(kind, object_key, e))
}

async fn delete<K>(api: Api<K>, kind: &'static str, namespace: &str, name: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(Error::from_write(kind, key(namespace, name), e)),
    }
}

async fn patch_status<K>(
    api: Api<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
    status: &Value,
) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await
        .map(|_| ())
        .map_err(|e| Error::from_write(kind, key(namespace, name), e))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>, Error> {
        get_opt(self.all(), "GatewayClass", "", name).await
    }

    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>, Error> {
        get_opt(self.namespaced(namespace), "Gateway", namespace, name).await
    }

    async fn list_gateways(&self) -> Result<Vec<Gateway>, Error> {
        list_all(self.all(), "Gateway", &ListParams::default()).await
    }

    async fn list_http_routes(&self) -> Result<Vec<HTTPRoute>, Error> {
        list_all(self.all(), "HTTPRoute", &ListParams::default()).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        get_opt(self.namespaced(namespace), "Service", namespace, name).await
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        get_opt(self.namespaced(namespace), "Ingress", namespace, name).await
    }

    async fn get_derived(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DerivedObject>, Error> {
        let label = kind.as_str();
        let object = match kind {
            DerivedKind::Service => get_opt::<Service>(self.namespaced(namespace), label, namespace, name)
                .await?
                .map(DerivedObject::Service),
            DerivedKind::Endpoints => {
                get_opt::<Endpoints>(self.namespaced(namespace), label, namespace, name)
                    .await?
                    .map(DerivedObject::Endpoints)
            }
            DerivedKind::EnvoyConfig => {
                get_opt::<CiliumEnvoyConfig>(self.namespaced(namespace), label, namespace, name)
                    .await?
                    .map(DerivedObject::EnvoyConfig)
            }
        };
        Ok(object)
    }

    async fn list_derived(
        &self,
        kind: DerivedKind,
        label_selector: &str,
    ) -> Result<Vec<DerivedObject>, Error> {
        let params = ListParams::default().labels(label_selector);
        let label = kind.as_str();
        let objects = match kind {
            DerivedKind::Service => list_all::<Service>(self.all(), label, &params)
                .await?
                .into_iter()
                .map(DerivedObject::Service)
                .collect(),
            DerivedKind::Endpoints => list_all::<Endpoints>(self.all(), label, &params)
                .await?
                .into_iter()
                .map(DerivedObject::Endpoints)
                .collect(),
            DerivedKind::EnvoyConfig => list_all::<CiliumEnvoyConfig>(self.all(), label, &params)
                .await?
                .into_iter()
                .map(DerivedObject::EnvoyConfig)
                .collect(),
        };
        Ok(objects)
    }

    async fn create_derived(&self, object: &DerivedObject) -> Result<(), Error> {
        let kind = object.kind().as_str();
        let ns = object.namespace();
        match object {
            DerivedObject::Service(o) => create(self.namespaced(ns), kind, o, object.key()).await,
            DerivedObject::Endpoints(o) => create(self.namespaced(ns), kind, o, object.key()).await,
            DerivedObject::EnvoyConfig(o) => create(self.namespaced(ns), kind, o, object.key()).await,
        }
    }

    async fn replace_derived(&self, object: &DerivedObject) -> Result<(), Error> {
        let kind = object.kind().as_str();
        let ns = object.namespace();
        let name = object.name();
        match object {
            DerivedObject::Service(o) => {
                replace(self.namespaced(ns), kind, name, o, object.key()).await
            }
            DerivedObject::Endpoints(o) => {
                replace(self.namespaced(ns), kind, name, o, object.key()).await
            }
            DerivedObject::EnvoyConfig(o) => {
                replace(self.namespaced(ns), kind, name, o, object.key()).await
            }
        }
    }

    async fn delete_derived(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let label = kind.as_str();
        match kind {
            DerivedKind::Service => {
                delete::<Service>(self.namespaced(namespace), label, namespace, name).await
            }
            DerivedKind::Endpoints => {
                delete::<Endpoints>(self.namespaced(namespace), label, namespace, name).await
            }
            DerivedKind::EnvoyConfig => {
                delete::<CiliumEnvoyConfig>(self.namespaced(namespace), label, namespace, name)
                    .await
            }
        }
    }

    async fn patch_gateway_class_status(&self, name: &str, status: &Value) -> Result<(), Error> {
        patch_status::<GatewayClass>(self.all(), "GatewayClass", "", name, status).await
    }

    async fn patch_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error> {
        patch_status::<Gateway>(self.namespaced(namespace), "Gateway", namespace, name, status)
            .await
    }

    async fn patch_http_route_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error> {
        patch_status::<HTTPRoute>(
            self.namespaced(namespace),
            "HTTPRoute",
            namespace,
            name,
            status,
        )
        .await
    }

    async fn patch_ingress_status(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), Error> {
        patch_status::<Ingress>(self.namespaced(namespace), "Ingress", namespace, name, status)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_cluster_scoped_objects() {
        assert_eq!(key("", "cilium"), "cilium");
        assert_eq!(key("default", "web"), "default/web");
    }

    #[tokio::test]
    async fn test_mock_client_is_object_safe() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_gateway_class()
            .with(mockall::predicate::eq("cilium"))
            .returning(|_| Ok(None));

        let client: std::sync::Arc<dyn ClusterClient> = std::sync::Arc::new(mock);
        let class = client.get_gateway_class("cilium").await.expect("lookup");
        assert!(class.is_none());
    }
}

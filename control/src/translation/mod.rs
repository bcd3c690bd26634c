//! Model → derived resource translation
//!
//! Translators are pure: the same [`RoutingModel`] always yields the same
//! [`DerivedResources`], which is what lets the reconcilers treat "no diff"
//! as "no write".
//!
//! - [`SharedTranslator`]: one derived set for every source feeding a gateway
//! - [`DedicatedTranslator`]: one derived set per source (per Ingress)

mod dedicated;
mod envoy;
mod shared;

pub use dedicated::DedicatedTranslator;
pub use shared::SharedTranslator;

use crate::apis::cilium::CiliumEnvoyConfig;
use crate::error::TranslationError;
use common::{FullyQualifiedResource, RoutingModel};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Name prefix of resources derived from Ingresses
pub const INGRESS_PREFIX: &str = "cilium-ingress";

/// Name prefix of resources derived from Gateways
pub const GATEWAY_PREFIX: &str = "cilium-gateway";

/// Label marking resources derived from Ingresses
pub const INGRESS_LABEL_KEY: &str = "cilium.io/ingress";

/// Label marking resources derived from Gateways
pub const GATEWAY_LABEL_KEY: &str = "cilium.io/gateway";

/// Placeholder backend keeping a fresh LoadBalancer service programmable
pub const PLACEHOLDER_ENDPOINT_IP: &str = "192.192.192.192";
pub const PLACEHOLDER_ENDPOINT_PORT: i32 = 9999;

/// Translates a routing model into derived resources
pub trait Translator: Send + Sync {
    fn translate(&self, model: &RoutingModel) -> Result<DerivedResources, TranslationError>;
}

/// Output of one translation
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedResources {
    pub envoy_config: CiliumEnvoyConfig,
    pub service: Service,
    pub endpoints: Endpoints,
}

impl DerivedResources {
    /// Objects in apply order: the service before its endpoints, the proxy
    /// configuration last
    pub fn into_objects(self) -> Vec<DerivedObject> {
        vec![
            DerivedObject::Service(self.service),
            DerivedObject::Endpoints(self.endpoints),
            DerivedObject::EnvoyConfig(self.envoy_config),
        ]
    }
}

/// Kinds of resources the translators produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DerivedKind {
    EnvoyConfig,
    Service,
    Endpoints,
}

impl DerivedKind {
    pub const ALL: [DerivedKind; 3] = [
        DerivedKind::Service,
        DerivedKind::Endpoints,
        DerivedKind::EnvoyConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedKind::EnvoyConfig => "CiliumEnvoyConfig",
            DerivedKind::Service => "Service",
            DerivedKind::Endpoints => "Endpoints",
        }
    }
}

/// A derived object of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedObject {
    EnvoyConfig(CiliumEnvoyConfig),
    Service(Service),
    Endpoints(Endpoints),
}

impl DerivedObject {
    pub fn kind(&self) -> DerivedKind {
        match self {
            DerivedObject::EnvoyConfig(_) => DerivedKind::EnvoyConfig,
            DerivedObject::Service(_) => DerivedKind::Service,
            DerivedObject::Endpoints(_) => DerivedKind::Endpoints,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            DerivedObject::EnvoyConfig(o) => &o.metadata,
            DerivedObject::Service(o) => &o.metadata,
            DerivedObject::Endpoints(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            DerivedObject::EnvoyConfig(o) => &mut o.metadata,
            DerivedObject::Service(o) => &mut o.metadata,
            DerivedObject::Endpoints(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// `namespace/name`, for logs and errors
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }
}

pub(crate) fn managed_labels(label_key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(label_key.to_string(), "true".to_string())])
}

/// Label selector matching resources managed under `label_key`
pub fn managed_selector(label_key: &str) -> String {
    format!("{label_key}=true")
}

pub(crate) fn owner_reference(source: &FullyQualifiedResource) -> OwnerReference {
    OwnerReference {
        api_version: source.api_version(),
        kind: source.kind.clone(),
        name: source.name.clone(),
        uid: source.uid.clone(),
        ..Default::default()
    }
}

pub(crate) fn object_meta(
    name: &str,
    namespace: &str,
    label_key: &str,
    owner: OwnerReference,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(managed_labels(label_key)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    }
}

/// Endpoints with a single unroutable backend.
///
/// The datapath refuses to program a service without backends; real
/// backends are managed elsewhere.
pub(crate) fn placeholder_endpoints(meta: ObjectMeta) -> Endpoints {
    Endpoints {
        metadata: meta,
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: PLACEHOLDER_ENDPOINT_IP.to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                port: PLACEHOLDER_ENDPOINT_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

pub(crate) fn first_source(model: &RoutingModel) -> Result<&FullyQualifiedResource, TranslationError> {
    model.primary_source().ok_or(TranslationError::EmptyModel)
}

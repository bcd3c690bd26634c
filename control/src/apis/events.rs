//! Watch events
//!
//! Raw watcher events carry only the new state of an object. The change
//! filter needs `(kind, old, new)`, so [`watch_changes`] looks the previous
//! version up in the reflector store before the event is applied to it.

use futures::{stream, Stream, StreamExt};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any object the change filter knows how to judge
#[derive(Debug, Clone)]
pub enum RoutingObject {
    GatewayClass(Arc<GatewayClass>),
    Gateway(Arc<Gateway>),
    HttpRoute(Arc<HTTPRoute>),
    Secret(Arc<Secret>),
}

impl RoutingObject {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingObject::GatewayClass(_) => "GatewayClass",
            RoutingObject::Gateway(_) => "Gateway",
            RoutingObject::HttpRoute(_) => "HTTPRoute",
            RoutingObject::Secret(_) => "Secret",
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects
    pub fn key(&self) -> String {
        let (namespace, name) = match self {
            RoutingObject::GatewayClass(o) => (o.namespace(), o.name_any()),
            RoutingObject::Gateway(o) => (o.namespace(), o.name_any()),
            RoutingObject::HttpRoute(o) => (o.namespace(), o.name_any()),
            RoutingObject::Secret(o) => (o.namespace(), o.name_any()),
        };
        match namespace {
            Some(ns) => format!("{ns}/{name}"),
            None => name,
        }
    }
}

/// Conversion into the tagged union
pub trait Routable: Sized {
    fn into_routing(object: Arc<Self>) -> RoutingObject;
}

impl Routable for GatewayClass {
    fn into_routing(object: Arc<Self>) -> RoutingObject {
        RoutingObject::GatewayClass(object)
    }
}

impl Routable for Gateway {
    fn into_routing(object: Arc<Self>) -> RoutingObject {
        RoutingObject::Gateway(object)
    }
}

impl Routable for HTTPRoute {
    fn into_routing(object: Arc<Self>) -> RoutingObject {
        RoutingObject::HttpRoute(object)
    }
}

impl Routable for Secret {
    fn into_routing(object: Arc<Self>) -> RoutingObject {
        RoutingObject::Secret(object)
    }
}

/// A single observed change
#[derive(Debug, Clone)]
pub struct Change<K> {
    pub kind: EventKind,
    /// Previous version; `None` for creates and for deletes of unseen objects
    pub old: Option<Arc<K>>,
    /// New version; for deletes, the last known state
    pub new: Arc<K>,
}

impl<K> Change<K> {
    /// Objects that still exist after this change
    pub fn is_live(&self) -> bool {
        self.kind != EventKind::Delete
    }
}

impl<K: Routable> Change<K> {
    pub fn old_object(&self) -> Option<RoutingObject> {
        self.old.clone().map(K::into_routing)
    }

    pub fn new_object(&self) -> RoutingObject {
        K::into_routing(self.new.clone())
    }
}

fn changes_for<K>(store: &Store<K>, event: &watcher::Event<K>) -> Vec<Change<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            let old = store.get(&ObjectRef::from_obj(obj));
            let kind = if old.is_some() {
                EventKind::Update
            } else {
                EventKind::Create
            };
            vec![Change {
                kind,
                old,
                new: Arc::new(obj.clone()),
            }]
        }
        watcher::Event::Delete(obj) => vec![Change {
            kind: EventKind::Delete,
            old: store.get(&ObjectRef::from_obj(obj)),
            new: Arc::new(obj.clone()),
        }],
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

/// Turn a watcher event stream into a stream of changes, keeping `writer`'s
/// store current.
///
/// Watcher errors are passed through so the caller's backoff applies.
pub fn watch_changes<K, S>(
    events: S,
    mut writer: Writer<K>,
) -> impl Stream<Item = Result<Change<K>, watcher::Error>> + Send
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
{
    let store = writer.as_reader();
    events.flat_map(move |event| {
        let items: Vec<Result<Change<K>, watcher::Error>> = match event {
            Ok(event) => {
                let changes = changes_for(&store, &event);
                writer.apply_watcher_event(&event);
                changes.into_iter().map(Ok).collect()
            }
            Err(err) => vec![Err(err)],
        };
        stream::iter(items)
    })
}

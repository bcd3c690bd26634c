//! Controller wiring
//!
//! One kube-rs `Controller` per reconciled kind. Primary watch streams go
//! through the change filter before they reach the scheduler; related kinds
//! (Secrets, HTTPRoutes, GatewayClasses) are mapped back to the Gateways that
//! depend on them. Derived resources are watched as owned objects so that
//! drift is corrected.

use crate::apis::cilium::CiliumEnvoyConfig;
use crate::apis::events::{watch_changes, Change, Routable};
use crate::apis::gateway::predicates::{parent_gateways, ChangeFilter, GatewayKey};
use crate::apis::gateway::{gateway, gateway_class, http_route};
use crate::apis::ingress::ingress;
use crate::apis::metrics::record_reconciliation_error;
use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::translation::{managed_selector, GATEWAY_LABEL_KEY, INGRESS_LABEL_KEY};
use futures::{future, stream, Stream, StreamExt};
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay after a write conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Shared state handed to every reconcile
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub config: ControllerConfig,
    pub filter: ChangeFilter,
}

impl Context {
    pub fn new(client: Arc<dyn ClusterClient>, config: ControllerConfig) -> Self {
        let filter = ChangeFilter::new(client.clone(), config.controller_name.clone());
        Self {
            client,
            config,
            filter,
        }
    }
}

/// Requeue policy shared by all reconcilers
pub fn error_policy<K>(object: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let key = match object.namespace() {
        Some(ns) => format!("{}/{}", ns, object.name_any()),
        None => object.name_any(),
    };
    warn!("{} {} reconciliation failed: {}", kind, key, error);
    record_reconciliation_error(&kind, error.metric_label());

    if error.is_conflict() {
        Action::requeue(CONFLICT_REQUEUE)
    } else {
        Action::requeue(ctx.config.error_requeue_interval())
    }
}

fn log_reconcile_result<T: Debug, E: std::fmt::Display>(
    controller: &'static str,
) -> impl Fn(Result<T, E>) -> future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => debug!("{} reconciled: {:?}", controller, object),
            Err(e) => error!("{} controller error: {}", controller, e),
        }
        future::ready(())
    }
}

fn log_watch_error<T>(kind: &str, item: Result<T, watcher::Error>) -> Option<T> {
    item.map_err(|e| warn!("{} watch error: {}", kind, e)).ok()
}

/// Watch `api` into a fresh store, emitting `(kind, old, new)` changes
fn changes<K>(
    api: Api<K>,
    config: watcher::Config,
) -> (
    Store<K>,
    impl Stream<Item = Result<Change<K>, watcher::Error>> + Send + 'static,
)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let events = watcher(api, config).default_backoff();
    (reader, watch_changes(events, writer))
}

/// Live objects whose change passes the filter
fn accepted<K, S>(
    changes: S,
    filter: ChangeFilter,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Routable + Clone + Send + Sync + 'static,
    S: Stream<Item = Result<Change<K>, watcher::Error>> + Send + 'static,
{
    changes.filter_map(move |change| {
        let filter = filter.clone();
        async move {
            match change {
                Ok(change) if change.is_live() => {
                    let old = change.old_object();
                    filter
                        .accept(change.kind, old.as_ref(), &change.new_object())
                        .await
                        .then(|| Ok(K::clone(&change.new)))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }
    })
}

/// Gateways to revisit after changes of related objects
fn gateway_dependents(
    client: &Client,
    gateways: Store<Gateway>,
    filter: &ChangeFilter,
) -> impl Stream<Item = ObjectRef<Gateway>> + Send + 'static {
    let (_, route_changes) = changes(Api::<HTTPRoute>::all(client.clone()), watcher::Config::default());
    let route_filter = filter.clone();
    let from_routes = route_changes
        .filter_map(move |change| {
            let filter = route_filter.clone();
            async move {
                let change = log_watch_error("HTTPRoute", change)?;
                let old = change.old_object();
                if !filter.accept(change.kind, old.as_ref(), &change.new_object()).await {
                    return None;
                }
                let mut keys = parent_gateways(&change.new);
                if let Some(old) = &change.old {
                    keys.extend(parent_gateways(old));
                }
                keys.sort();
                keys.dedup();
                Some(stream::iter(keys))
            }
        })
        .flatten();

    let (_, secret_changes) = changes(Api::<Secret>::all(client.clone()), watcher::Config::default());
    let secret_filter = filter.clone();
    let from_secrets = secret_changes
        .filter_map(move |change| {
            let filter = secret_filter.clone();
            async move {
                let change = log_watch_error("Secret", change)?;
                let old = change.old_object();
                if !filter.accept(change.kind, old.as_ref(), &change.new_object()).await {
                    return None;
                }
                Some(stream::iter(filter.gateways_for_secret(&change.new).await))
            }
        })
        .flatten();

    let (_, class_changes) =
        changes(Api::<GatewayClass>::all(client.clone()), watcher::Config::default());
    let class_filter = filter.clone();
    let from_classes = class_changes
        .filter_map(move |change| {
            let filter = class_filter.clone();
            let gateways = gateways.clone();
            async move {
                let change = log_watch_error("GatewayClass", change)?;
                let old = change.old_object();
                if !filter.accept(change.kind, old.as_ref(), &change.new_object()).await {
                    return None;
                }
                let class_name = change.new.name_any();
                let keys: Vec<GatewayKey> = gateways
                    .state()
                    .iter()
                    .filter(|g| g.spec.gateway_class_name == class_name)
                    .map(|g| GatewayKey::of(g))
                    .collect();
                Some(stream::iter(keys))
            }
        })
        .flatten();

    stream::select_all(vec![
        from_routes.boxed(),
        from_secrets.boxed(),
        from_classes.boxed(),
    ])
    .map(|key| {
        debug!("Gateway {} triggered by a related change", key);
        key.object_ref()
    })
}

/// Run the GatewayClass controller until shutdown
pub async fn run_gateway_class_controller(client: Client, ctx: Arc<Context>) {
    let (classes, class_changes) =
        changes(Api::<GatewayClass>::all(client), watcher::Config::default());
    info!("- GatewayClass controller");

    Controller::for_stream(accepted(class_changes, ctx.filter.clone()), classes)
        .shutdown_on_signal()
        .run(gateway_class::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("GatewayClass"))
        .await;
}

/// Run the Gateway controller until shutdown
pub async fn run_gateway_controller(client: Client, ctx: Arc<Context>) {
    let (gateways, gateway_changes) =
        changes(Api::<Gateway>::all(client.clone()), watcher::Config::default());
    let dependents = gateway_dependents(&client, gateways.clone(), &ctx.filter);
    let owned = watcher::Config::default().labels(&managed_selector(GATEWAY_LABEL_KEY));
    info!("- Gateway controller");

    Controller::for_stream(accepted(gateway_changes, ctx.filter.clone()), gateways)
        .owns(Api::<CiliumEnvoyConfig>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<Endpoints>::all(client), owned)
        .reconcile_on(dependents)
        .shutdown_on_signal()
        .run(gateway::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Gateway"))
        .await;
}

/// Run the HTTPRoute controller until shutdown
pub async fn run_http_route_controller(client: Client, ctx: Arc<Context>) {
    let (routes, route_changes) =
        changes(Api::<HTTPRoute>::all(client.clone()), watcher::Config::default());
    let (_, gateway_changes) = changes(Api::<Gateway>::all(client), watcher::Config::default());

    let route_store = routes.clone();
    let gateway_filter = ctx.filter.clone();
    let from_gateways = gateway_changes
        .filter_map(move |change| {
            let filter = gateway_filter.clone();
            let routes = route_store.clone();
            async move {
                let change = log_watch_error("Gateway", change)?;
                // Deletes pass unfiltered
                if change.is_live() {
                    let old = change.old_object();
                    if !filter.accept(change.kind, old.as_ref(), &change.new_object()).await {
                        return None;
                    }
                }
                let key = GatewayKey::of(&change.new);
                let refs: Vec<ObjectRef<HTTPRoute>> = routes
                    .state()
                    .iter()
                    .filter(|r| parent_gateways(r).contains(&key))
                    .map(|r| ObjectRef::<HTTPRoute>::from_obj(r))
                    .collect();
                Some(stream::iter(refs))
            }
        })
        .flatten();
    info!("- HTTPRoute controller");

    Controller::for_stream(accepted(route_changes, ctx.filter.clone()), routes)
        .reconcile_on(from_gateways)
        .shutdown_on_signal()
        .run(http_route::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("HTTPRoute"))
        .await;
}

/// Run the Ingress controller until shutdown
pub async fn run_ingress_controller(client: Client, ctx: Arc<Context>) {
    let (ingresses, ingress_changes) =
        changes(Api::<Ingress>::all(client.clone()), watcher::Config::default());
    let class_name = ctx.config.ingress.class_name.clone();
    let trigger = ingress_changes.filter_map(move |change| {
        let object = match change {
            Ok(change) if change.is_live() && ingress::accept_change(&change, &class_name) => {
                Some(Ok(Ingress::clone(&change.new)))
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        };
        future::ready(object)
    });
    let owned = watcher::Config::default().labels(&managed_selector(INGRESS_LABEL_KEY));
    info!("- Ingress controller (class {})", ctx.config.ingress.class_name);

    Controller::for_stream(trigger, ingresses)
        .owns(Api::<CiliumEnvoyConfig>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<Endpoints>::all(client), owned)
        .shutdown_on_signal()
        .run(ingress::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Ingress"))
        .await;
}

/// Run every enabled controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) {
    info!("Starting controllers for {}", ctx.config.controller_name);

    let ingress = async {
        if ctx.config.ingress.enabled {
            run_ingress_controller(client.clone(), ctx.clone()).await
        } else {
            info!("Ingress support disabled");
        }
    };

    tokio::join!(
        run_gateway_class_controller(client.clone(), ctx.clone()),
        run_gateway_controller(client.clone(), ctx.clone()),
        run_http_route_controller(client.clone(), ctx.clone()),
        ingress,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::events::EventKind;
    use crate::client::MockClusterClient;
    use crate::config::DEFAULT_CONTROLLER_NAME;
    use futures::executor::block_on;
    use gateway_api::apis::standard::gatewayclasses::{GatewayClassSpec, GatewayClassStatus};
    use gateway_api::apis::standard::gateways::GatewaySpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ctx() -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(MockClusterClient::new()),
            ControllerConfig::default(),
        ))
    }

    fn class(name: &str, controller: &str) -> GatewayClass {
        GatewayClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: GatewayClassSpec {
                controller_name: controller.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn change(kind: EventKind, old: Option<GatewayClass>, new: GatewayClass) -> Change<GatewayClass> {
        Change {
            kind,
            old: old.map(Arc::new),
            new: Arc::new(new),
        }
    }

    #[test]
    fn test_context_filter_uses_configured_controller() {
        assert_eq!(ctx().filter.controller_name(), DEFAULT_CONTROLLER_NAME);
    }

    #[test]
    fn test_error_policy_requeues() {
        let gateway = Arc::new(Gateway {
            metadata: ObjectMeta {
                name: Some("edge".to_string()),
                namespace: Some("infra".to_string()),
                ..Default::default()
            },
            spec: GatewaySpec::default(),
            status: None,
        });

        let conflict = Error::Conflict {
            kind: "Service",
            key: "infra/cilium-gateway-edge".to_string(),
        };
        assert_eq!(
            error_policy(gateway.clone(), &conflict, ctx()),
            Action::requeue(CONFLICT_REQUEUE)
        );

        let lookup = Error::lookup("GatewayClass", "cilium", "timeout");
        assert_eq!(
            error_policy(gateway, &lookup, ctx()),
            Action::requeue(ControllerConfig::default().error_requeue_interval())
        );
    }

    #[test]
    fn test_accepted_stream_keeps_relevant_live_changes() {
        let ours = class("cilium", DEFAULT_CONTROLLER_NAME);
        let mut status_only = ours.clone();
        status_only.status = Some(GatewayClassStatus::default());

        let changes = vec![
            Ok(change(EventKind::Create, None, ours.clone())),
            Ok(change(EventKind::Create, None, class("other", "other/controller"))),
            Ok(change(EventKind::Update, Some(ours.clone()), status_only)),
            Ok(change(EventKind::Delete, Some(ours.clone()), ours)),
        ];

        let passed: Vec<GatewayClass> = block_on(
            accepted(stream::iter(changes), ctx().filter.clone())
                .map(|item| item.expect("no watch errors"))
                .collect(),
        );
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].name_any(), "cilium");
    }
}

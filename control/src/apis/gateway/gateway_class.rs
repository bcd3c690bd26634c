//! GatewayClass reconciler
//!
//! Accepts GatewayClasses whose `spec.controllerName` names this controller.

use crate::apis::conditions::{condition, has_condition, status_value, ACCEPTED};
use crate::apis::metrics::record_reconciliation;
use crate::controller::Context;
use crate::error::Result;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const KIND: &str = "GatewayClass";

/// Status patch accepting `class`
pub fn accepted_status(class: &GatewayClass, controller_name: &str) -> Value {
    let existing = status_value(class);
    let generation = class.metadata.generation.unwrap_or(0);
    json!({
        "status": {
            "conditions": [condition(
                &existing["conditions"],
                ACCEPTED,
                true,
                "Accepted",
                &format!("GatewayClass is accepted by controller {}", controller_name),
                generation,
            )]
        }
    })
}

/// Reconcile a single GatewayClass
pub async fn reconcile(class: Arc<GatewayClass>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = class.name_any();
    let controller_name = &ctx.config.controller_name;

    if class.spec.controller_name != *controller_name {
        debug!(
            "GatewayClass {} has controllerName '{}', ignoring",
            name, class.spec.controller_name
        );
        return Ok(Action::await_change());
    }

    let generation = class.metadata.generation.unwrap_or(0);
    let status = status_value(&*class);
    if has_condition(&status["conditions"], ACCEPTED, true, generation) {
        debug!("GatewayClass {} already accepted at generation {}", name, generation);
    } else {
        ctx.client
            .patch_gateway_class_status(&name, &accepted_status(&class, controller_name))
            .await?;
        info!("Accepted GatewayClass {}", name);
    }

    record_reconciliation(KIND, start.elapsed().as_secs_f64(), "success");
    Ok(Action::requeue(ctx.config.requeue_interval()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::config::{ControllerConfig, DEFAULT_CONTROLLER_NAME};
    use gateway_api::apis::standard::gatewayclasses::{GatewayClassSpec, GatewayClassStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn class(controller: &str) -> GatewayClass {
        GatewayClass {
            metadata: ObjectMeta {
                name: Some("cilium".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: GatewayClassSpec {
                controller_name: controller.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn ctx(mock: MockClusterClient) -> Arc<Context> {
        Arc::new(Context::new(Arc::new(mock), ControllerConfig::default()))
    }

    #[tokio::test]
    async fn test_own_class_is_accepted() {
        let mut mock = MockClusterClient::new();
        mock.expect_patch_gateway_class_status()
            .times(1)
            .withf(|name, status| {
                name == "cilium"
                    && status["status"]["conditions"][0]["type"] == "Accepted"
                    && status["status"]["conditions"][0]["status"] == "True"
                    && status["status"]["conditions"][0]["observedGeneration"] == 1
            })
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(class(DEFAULT_CONTROLLER_NAME)), ctx(mock))
            .await
            .expect("reconcile");
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().requeue_interval())
        );
    }

    #[tokio::test]
    async fn test_foreign_class_is_ignored() {
        let mut mock = MockClusterClient::new();
        mock.expect_patch_gateway_class_status().never();

        let action = reconcile(Arc::new(class("other/controller")), ctx(mock))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_already_accepted_class_is_not_patched() {
        let mut accepted = class(DEFAULT_CONTROLLER_NAME);
        let status = accepted_status(&accepted, DEFAULT_CONTROLLER_NAME);
        let parsed: GatewayClassStatus =
            serde_json::from_value(status["status"].clone()).expect("status");
        accepted.status = Some(parsed);

        let mut mock = MockClusterClient::new();
        mock.expect_patch_gateway_class_status().never();

        reconcile(Arc::new(accepted), ctx(mock))
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn test_patch_failure_is_returned() {
        let mut mock = MockClusterClient::new();
        mock.expect_patch_gateway_class_status().returning(|name, _| {
            Err(crate::error::Error::Apply {
                kind: KIND,
                key: name.to_string(),
                message: "forbidden".to_string(),
            })
        });

        let result = reconcile(Arc::new(class(DEFAULT_CONTROLLER_NAME)), ctx(mock)).await;
        assert!(result.is_err());
    }
}

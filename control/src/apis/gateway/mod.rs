//! Gateway API support (v1)
//!
//! - GatewayClass: controller identity and acceptance
//! - Gateway: listeners, shared load balancer, derived resources
//! - HTTPRoute: per-parent status
//! - predicates: change-relevance filter and reverse mappings

#[allow(clippy::module_inception)]
pub mod gateway;
pub mod gateway_class;
pub mod http_route;
pub mod model_builder;
pub mod predicates;

//! Kubernetes API integrations
//!
//! Reconcilers and watch plumbing for Gateway API (v1) and networking/v1
//! Ingress, plus the CiliumEnvoyConfig custom resource they produce.

pub mod cilium;
pub mod conditions;
pub mod events;
pub mod gateway;
pub mod ingress;
pub mod metrics;

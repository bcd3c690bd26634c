//! Cilium-style Gateway API and Ingress control plane
//!
//! Watches GatewayClass, Gateway, HTTPRoute and Ingress resources, builds a
//! routing model per Gateway (shared mode) or per Ingress (dedicated mode)
//! and keeps the derived CiliumEnvoyConfig, Service and Endpoints in sync.

pub mod apis;
pub mod apply;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod translation;

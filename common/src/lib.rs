//! Routing model
//!
//! Normalized, translation-ready representation of routing intent. A model is
//! built fresh for every reconcile from Gateway/HTTPRoute or Ingress resources
//! and handed to a translator; it is never cached across cycles.
//!
//! Ordering is significant everywhere in this crate: listeners, sources and
//! routes keep the order in which they were ingested so that translation is
//! deterministic.

use std::collections::BTreeSet;
use std::fmt;

/// Hostname used by listeners and routes that match any host
pub const WILDCARD_HOSTNAME: &str = "*";

/// Normalized routing intent for one listener group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoutingModel {
    /// HTTP listeners, in ingestion order
    pub http: Vec<HttpListener>,
}

impl RoutingModel {
    pub fn new(http: Vec<HttpListener>) -> Self {
        Self { http }
    }

    /// True when there is nothing a translator could derive identity from
    pub fn is_empty(&self) -> bool {
        self.primary_source().is_none()
    }

    /// The first source of the first listener.
    ///
    /// Derived resource names and owner references come from this source,
    /// even when several sources feed one shared configuration.
    pub fn primary_source(&self) -> Option<&FullyQualifiedResource> {
        self.http.first()?.sources.first()
    }

    /// All distinct backends referenced by any route, sorted
    pub fn backends(&self) -> Vec<Backend> {
        self.http
            .iter()
            .flat_map(|l| l.routes.iter())
            .flat_map(|r| r.backends.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// All distinct TLS secrets referenced by any listener, sorted
    pub fn tls_secrets(&self) -> Vec<TlsSecret> {
        self.http
            .iter()
            .flat_map(|l| l.tls.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct listener ports, sorted
    pub fn ports(&self) -> Vec<u32> {
        self.http
            .iter()
            .map(|l| l.port)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Identity of the cluster resource a listener originated from
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FullyQualifiedResource {
    pub name: String,
    pub namespace: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub uid: String,
}

impl FullyQualifiedResource {
    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for FullyQualifiedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// An HTTP(S) listener and the routes attached to it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HttpListener {
    pub name: String,
    /// Resources that contributed this listener, in ingestion order
    pub sources: Vec<FullyQualifiedResource>,
    pub address: String,
    pub port: u32,
    /// Hostname served by the listener, `*` for any
    pub hostname: String,
    /// Certificates terminating TLS on this listener; empty for plain HTTP
    pub tls: Vec<TlsSecret>,
    pub routes: Vec<HttpRoute>,
}

impl HttpListener {
    pub fn is_secure(&self) -> bool {
        !self.tls.is_empty()
    }
}

/// Reference to a TLS certificate secret
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TlsSecret {
    pub name: String,
    pub namespace: String,
}

/// Path matching for a route
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StringMatch {
    Prefix(String),
    Exact(String),
    Regex(String),
}

impl Default for StringMatch {
    fn default() -> Self {
        StringMatch::Prefix("/".to_string())
    }
}

impl StringMatch {
    pub fn value(&self) -> &str {
        match self {
            StringMatch::Prefix(v) | StringMatch::Exact(v) | StringMatch::Regex(v) => v,
        }
    }
}

/// A routing rule: where matching requests go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HttpRoute {
    pub name: String,
    /// Hostnames this route applies to; empty means the listener's hostname
    pub hostnames: Vec<String>,
    pub path_match: StringMatch,
    pub backends: Vec<Backend>,
}

/// A backend service reference
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backend {
    pub name: String,
    pub namespace: String,
    pub port: Option<BackendPort>,
}

impl Backend {
    /// Port number if set, otherwise the port name, otherwise empty
    pub fn port_key(&self) -> String {
        match &self.port {
            Some(p) if p.port != 0 => p.port.to_string(),
            Some(p) => p.name.clone(),
            None => String::new(),
        }
    }

    /// Stable upstream cluster name: `<namespace>/<name>:<port>`
    pub fn cluster_name(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.name, self.port_key())
    }
}

/// Service port, by number or by name
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackendPort {
    pub port: u32,
    pub name: String,
}

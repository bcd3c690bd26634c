use thiserror::Error;

/// Control plane errors
///
/// Every variant except `Translation` is produced at the cluster I/O
/// boundary. A reconcile returning any of them is retried by the scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// A referenced resource could not be read
    #[error("failed to read {kind} {key}: {message}")]
    Lookup {
        kind: &'static str,
        key: String,
        message: String,
    },

    /// The routing model cannot be translated
    #[error("translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Optimistic concurrency violation; resolved by re-running the reconcile
    #[error("conflict writing {kind} {key}")]
    Conflict { kind: &'static str, key: String },

    /// Any other write failure
    #[error("failed to write {kind} {key}: {message}")]
    Apply {
        kind: &'static str,
        key: String,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Model is not translatable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("model source can't be empty")]
    EmptyModel,
}

impl Error {
    pub fn lookup(kind: &'static str, key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Lookup {
            kind,
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Classify a failed write: HTTP 409 becomes `Conflict`, the rest `Apply`
    pub fn from_write(kind: &'static str, key: impl Into<String>, err: kube::Error) -> Self {
        let key = key.into();
        match err {
            kube::Error::Api(ref response) if response.code == 409 => Self::Conflict { kind, key },
            other => Self::Apply {
                kind,
                key,
                message: other.to_string(),
            },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short label for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Lookup { .. } => "lookup_error",
            Self::Translation(_) => "translation_error",
            Self::Conflict { .. } => "conflict",
            Self::Apply { .. } => "apply_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_model_message() {
        let err = Error::from(TranslationError::EmptyModel);
        assert_eq!(err.to_string(), "translation error: model source can't be empty");
        assert_eq!(err.metric_label(), "translation_error");
    }

    #[test]
    fn test_lookup_error_carries_key() {
        let err = Error::lookup("GatewayClass", "cilium", "not found");
        assert_eq!(err.to_string(), "failed to read GatewayClass cilium: not found");
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_conflict_is_detected() {
        let err = Error::Conflict {
            kind: "Service",
            key: "default/cilium-ingress-web".to_string(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.metric_label(), "conflict");
    }
}

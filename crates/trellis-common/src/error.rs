//! Error types for the Trellis operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Engine errors carry the kind and namespaced name of the child resource
//! they relate to; configuration errors carry the owning instance and,
//! where known, the offending field path.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error without a specific child resource attached
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Reading a child resource failed
    #[error("failed to get {kind} {namespace}/{name}: {source}")]
    GetFailed {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Creating a child resource failed
    #[error("failed to create {kind} {namespace}/{name}: {source}")]
    CreateFailed {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Updating a child resource failed
    #[error("failed to update {kind} {namespace}/{name}: {source}")]
    UpdateFailed {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Deleting a child resource failed
    #[error("failed to delete {kind} {namespace}/{name}: {source}")]
    DeleteFailed {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Dry-run write (server-side defaulting) failed
    #[error("dry-run for {kind} {namespace}/{name} failed: {source}")]
    DryRunFailed {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// A child resource exists but is not controlled by the expected owner.
    ///
    /// The engine refuses to mutate or delete such resources. Retrying does
    /// not help; the colliding resource must be removed or renamed.
    #[error("{kind} {namespace}/{name} is not controlled by {owner}")]
    NotControlledBy {
        /// Kind of the child resource
        kind: String,
        /// Namespace of the child resource
        namespace: String,
        /// Name of the child resource
        name: String,
        /// Identity of the expected owner (kind/name)
        owner: String,
    },

    /// Invalid instance configuration (bad URI scheme, disabled feature,
    /// missing config-map key). Requires a spec change to resolve.
    #[error("configuration error for {instance}: {message}")]
    Configuration {
        /// Name of the inference service with invalid configuration
        instance: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.model.uri")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "engine")
        context: String,
    },
}

impl Error {
    /// Wrap a kube error from a failed get
    pub fn get_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::GetFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Wrap a kube error from a failed create
    pub fn create_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::CreateFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Wrap a kube error from a failed update
    pub fn update_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::UpdateFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Wrap a kube error from a failed delete
    pub fn delete_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::DeleteFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Wrap a kube error from a failed dry-run write
    pub fn dry_run_failed(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::DryRunFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source,
        }
    }

    /// Create an ownership violation error
    pub fn not_controlled_by(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::NotControlledBy {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create a configuration error without instance context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            instance: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with instance context
    pub fn configuration_for(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            instance: instance.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with instance context and field path
    pub fn configuration_for_field(
        instance: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            instance: instance.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, serialization, and ownership errors are not retryable:
    /// they require a spec fix or manual cleanup. API transport errors are
    /// retryable unless the server returned a non-conflict 4xx. Conflicts
    /// (409) are always retryable since they resolve on re-fetch.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => retryable_kube_error(source),
            Error::GetFailed { source, .. } => retryable_kube_error(source),
            Error::CreateFailed { source, .. } => retryable_kube_error(source),
            Error::UpdateFailed { source, .. } => retryable_kube_error(source),
            Error::DeleteFailed { source, .. } => retryable_kube_error(source),
            Error::DryRunFailed { source, .. } => retryable_kube_error(source),
            Error::NotControlledBy { .. } => false,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is a resource-version conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        let source = match self {
            Error::Kube { source } => source,
            Error::GetFailed { source, .. } => source,
            Error::CreateFailed { source, .. } => source,
            Error::UpdateFailed { source, .. } => source,
            Error::DeleteFailed { source, .. } => source,
            Error::DryRunFailed { source, .. } => source,
            _ => return false,
        };
        matches!(source, kube::Error::Api(ae) if ae.code == 409)
    }

    /// Get the instance name if this error is associated with one
    pub fn instance(&self) -> Option<&str> {
        match self {
            Error::Configuration { instance, .. } => Some(instance),
            _ => None,
        }
    }

    /// Get the child-resource identity (kind, namespace, name) if present
    pub fn resource(&self) -> Option<(&str, &str, &str)> {
        match self {
            Error::GetFailed {
                kind,
                namespace,
                name,
                ..
            }
            | Error::CreateFailed {
                kind,
                namespace,
                name,
                ..
            }
            | Error::UpdateFailed {
                kind,
                namespace,
                name,
                ..
            }
            | Error::DeleteFailed {
                kind,
                namespace,
                name,
                ..
            }
            | Error::DryRunFailed {
                kind,
                namespace,
                name,
                ..
            }
            | Error::NotControlledBy {
                kind,
                namespace,
                name,
                ..
            } => Some((kind, namespace, name)),
            _ => None,
        }
    }
}

/// Transient K8s errors (connection, timeout, 5xx, conflicts) retry;
/// non-conflict 4xx errors do not.
fn retryable_kube_error(source: &kube::Error) -> bool {
    match source {
        kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Propagation Through Reconciliation
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during
    // inference-service reconciliation. Each error type represents a
    // different failure category with specific handling requirements.

    /// Story: Bad model URIs are caught before any child is written
    ///
    /// When a user points spec.model.uri at an unsupported scheme, the
    /// reconciler fails synchronously with a clear, non-retryable error.
    #[test]
    fn story_configuration_errors_require_spec_change() {
        let err = Error::configuration_for_field(
            "llama-70b",
            "spec.model.uri",
            "unsupported storage scheme \"ftp\"",
        );
        assert!(err.to_string().contains("llama-70b"));
        assert!(err.to_string().contains("unsupported storage scheme"));
        assert!(!err.is_retryable());
        assert_eq!(err.instance(), Some("llama-70b"));

        match &err {
            Error::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.model.uri"));
            }
            _ => panic!("Expected Configuration variant"),
        }

        // Modelcar disabled but an oci:// URI supplied
        let err = Error::configuration_for("llama-70b", "oci model storage is disabled");
        assert!(!err.is_retryable());
    }

    /// Story: Engine errors name the exact child resource that failed
    #[test]
    fn story_engine_errors_carry_resource_identity() {
        let err = Error::update_failed("Deployment", "ml", "llama-workload", api_error(500));
        assert!(err.to_string().contains("Deployment"));
        assert!(err.to_string().contains("ml/llama-workload"));
        assert_eq!(err.resource(), Some(("Deployment", "ml", "llama-workload")));

        let err = Error::create_failed("Service", "ml", "llama-workload-svc", api_error(503));
        assert!(err.to_string().contains("ml/llama-workload-svc"));
        assert!(err.is_retryable());
    }

    /// Story: Ownership violations are fatal for the operation
    ///
    /// A Deployment with a colliding name that belongs to someone else is
    /// never mutated. Retrying does not resolve the collision.
    #[test]
    fn story_ownership_violations_do_not_retry() {
        let err = Error::not_controlled_by(
            "Deployment",
            "ml",
            "llama-workload",
            "TrellisInferenceService/llama",
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not controlled by"));
        assert!(err.to_string().contains("TrellisInferenceService/llama"));
        assert_eq!(err.resource(), Some(("Deployment", "ml", "llama-workload")));
    }

    /// Story: Conflicts retry, other client errors do not
    ///
    /// Resource-version conflicts are a normal part of optimistic
    /// concurrency; the engine re-fetches and retries them. A 422 from a
    /// validation webhook will not improve on retry.
    #[test]
    fn story_conflicts_are_retryable_other_4xx_not() {
        let conflict = Error::update_failed("Deployment", "ml", "w", api_error(409));
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());

        let invalid = Error::update_failed("Deployment", "ml", "w", api_error(422));
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_conflict());

        let forbidden = Error::create_failed("Role", "ml", "r", api_error(403));
        assert!(!forbidden.is_retryable());

        let throttled = Error::get_failed("Pod", "ml", "p", api_error(429));
        assert!(throttled.is_retryable());

        let server = Error::delete_failed("Secret", "ml", "s", api_error(500));
        assert!(server.is_retryable());
    }

    /// Story: Serialization errors surface manifest/config issues
    #[test]
    fn story_serialization_errors_in_config_processing() {
        let err = Error::serialization("invalid YAML: unexpected key");
        assert!(err.to_string().contains("serialization error"));
        assert!(!err.is_retryable());

        let err = Error::serialization_for_kind("TrellisInferenceConfig", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("TrellisInferenceConfig"));
            }
            _ => panic!("Expected Serialization variant"),
        }
    }

    /// Story: Error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic_msg = format!("config map {} not found", "scheduler-config");
        let err = Error::configuration(dynamic_msg);
        assert!(err.to_string().contains("scheduler-config"));

        let err = Error::internal("static message");
        assert!(err.to_string().contains("static message"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_internal_error_with_context() {
        let err = Error::internal_with_context("engine", "unexpected state");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[engine]"));
        assert!(err.to_string().contains("unexpected state"));
    }

    #[test]
    fn test_configuration_default_instance() {
        let err = Error::configuration("bad uri");
        match &err {
            Error::Configuration { instance, .. } => {
                assert_eq!(instance, super::UNKNOWN_CONTEXT);
            }
            _ => panic!("Expected Configuration variant"),
        }
    }

    #[test]
    fn test_kube_transport_error_is_retryable() {
        let err = Error::from(api_error(500));
        assert!(err.is_retryable());

        let err = Error::from(api_error(404));
        assert!(!err.is_retryable());
    }
}

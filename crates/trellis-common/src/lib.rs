//! Common types for Trellis: CRDs, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Trellis system resources (operator, shared configs, CA bundle)
pub const TRELLIS_SYSTEM_NAMESPACE: &str = "trellis-system";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "trellis-operator";

/// Annotation that halts reconciliation and tears down children when set to "true"
pub const STOP_ANNOTATION: &str = "trellis.dev/stop";

/// Annotation recording the one-way inference-pool API migration ("v1" = migrated)
pub const POOL_MIGRATION_ANNOTATION: &str = "trellis.dev/pool-migrated";

/// Value of [`POOL_MIGRATION_ANNOTATION`] once the migration has committed
pub const POOL_MIGRATION_V1: &str = "v1";

/// Label key identifying which instance a child resource belongs to
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label key identifying the child's function within an instance
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Label key tying children back to the owning CRD kind
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Value of [`LABEL_PART_OF`] on every managed child
pub const PART_OF_VALUE: &str = "trellisinferenceservice";

/// Label key for the serving role of a workload pod (decode, prefill, both)
pub const LABEL_ROLE: &str = "trellis.dev/role";

/// Name of the serving container every pod template must provide
pub const MAIN_CONTAINER_NAME: &str = "main";

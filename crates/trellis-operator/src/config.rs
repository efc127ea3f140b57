//! Operator configuration
//!
//! Cluster-level settings the operator reads once at startup. Everything
//! here is environment-driven so deployments configure the operator through
//! its own pod spec rather than a separate config object.

use trellis_common::TRELLIS_SYSTEM_NAMESPACE;

const ENV_STORAGE_INITIALIZER_IMAGE: &str = "TRELLIS_STORAGE_INITIALIZER_IMAGE";
const ENV_STORAGE_CPU_REQUEST: &str = "TRELLIS_STORAGE_CPU_REQUEST";
const ENV_STORAGE_CPU_LIMIT: &str = "TRELLIS_STORAGE_CPU_LIMIT";
const ENV_STORAGE_MEMORY_REQUEST: &str = "TRELLIS_STORAGE_MEMORY_REQUEST";
const ENV_STORAGE_MEMORY_LIMIT: &str = "TRELLIS_STORAGE_MEMORY_LIMIT";
const ENV_ENABLE_MODELCAR: &str = "TRELLIS_ENABLE_MODELCAR";
const ENV_MODELCAR_CPU: &str = "TRELLIS_MODELCAR_CPU";
const ENV_MODELCAR_MEMORY: &str = "TRELLIS_MODELCAR_MEMORY";
const ENV_ENDPOINT_PICKER_IMAGE: &str = "TRELLIS_ENDPOINT_PICKER_IMAGE";
const ENV_CA_BUNDLE_CONFIGMAP: &str = "TRELLIS_CA_BUNDLE_CONFIGMAP";
const ENV_CA_BUNDLE_MOUNT_PATH: &str = "TRELLIS_CA_BUNDLE_MOUNT_PATH";
const ENV_SYSTEM_NAMESPACE: &str = "TRELLIS_SYSTEM_NAMESPACE";

/// Settings shared by every reconcile.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image for the storage-initializer init container (hf:// and s3://)
    pub storage_initializer_image: String,

    /// CPU request for the storage-initializer container
    pub storage_cpu_request: String,

    /// CPU limit for the storage-initializer container
    pub storage_cpu_limit: String,

    /// Memory request for the storage-initializer container
    pub storage_memory_request: String,

    /// Memory limit for the storage-initializer container
    pub storage_memory_limit: String,

    /// Whether oci:// modelcar sidecars may be attached
    pub enable_modelcar: bool,

    /// CPU request and limit for modelcar containers
    pub modelcar_cpu: String,

    /// Memory request and limit for modelcar containers
    pub modelcar_memory: String,

    /// Default image for the endpoint-picker scheduler deployment
    pub endpoint_picker_image: String,

    /// CA bundle ConfigMap in the system namespace, injected into
    /// storage-initializer containers when set
    pub ca_bundle_config_map: Option<String>,

    /// Directory the CA bundle is mounted at when no secret annotation
    /// overrides it
    pub ca_bundle_mount_path: String,

    /// Namespace holding operator-wide resources (fallback for config
    /// lookups, home of the global CA bundle copy)
    pub system_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            storage_initializer_image: "ghcr.io/trellis-dev/storage-initializer:latest".to_string(),
            storage_cpu_request: "100m".to_string(),
            storage_cpu_limit: "1".to_string(),
            storage_memory_request: "100Mi".to_string(),
            storage_memory_limit: "1Gi".to_string(),
            enable_modelcar: true,
            modelcar_cpu: "10m".to_string(),
            modelcar_memory: "15Mi".to_string(),
            endpoint_picker_image: "registry.k8s.io/gateway-api-inference-extension/epp:main"
                .to_string(),
            ca_bundle_config_map: None,
            ca_bundle_mount_path: "/etc/ssl/custom-certs".to_string(),
            system_namespace: TRELLIS_SYSTEM_NAMESPACE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_initializer_image: std::env::var(ENV_STORAGE_INITIALIZER_IMAGE)
                .unwrap_or(defaults.storage_initializer_image),
            storage_cpu_request: std::env::var(ENV_STORAGE_CPU_REQUEST)
                .unwrap_or(defaults.storage_cpu_request),
            storage_cpu_limit: std::env::var(ENV_STORAGE_CPU_LIMIT)
                .unwrap_or(defaults.storage_cpu_limit),
            storage_memory_request: std::env::var(ENV_STORAGE_MEMORY_REQUEST)
                .unwrap_or(defaults.storage_memory_request),
            storage_memory_limit: std::env::var(ENV_STORAGE_MEMORY_LIMIT)
                .unwrap_or(defaults.storage_memory_limit),
            enable_modelcar: std::env::var(ENV_ENABLE_MODELCAR)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enable_modelcar),
            modelcar_cpu: std::env::var(ENV_MODELCAR_CPU).unwrap_or(defaults.modelcar_cpu),
            modelcar_memory: std::env::var(ENV_MODELCAR_MEMORY).unwrap_or(defaults.modelcar_memory),
            endpoint_picker_image: std::env::var(ENV_ENDPOINT_PICKER_IMAGE)
                .unwrap_or(defaults.endpoint_picker_image),
            ca_bundle_config_map: std::env::var(ENV_CA_BUNDLE_CONFIGMAP)
                .ok()
                .filter(|v| !v.is_empty()),
            ca_bundle_mount_path: std::env::var(ENV_CA_BUNDLE_MOUNT_PATH)
                .unwrap_or(defaults.ca_bundle_mount_path),
            system_namespace: std::env::var(ENV_SYSTEM_NAMESPACE)
                .unwrap_or(defaults.system_namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_modelcar_without_ca_bundle() {
        let config = OperatorConfig::default();
        assert!(config.enable_modelcar);
        assert!(config.ca_bundle_config_map.is_none());
        assert_eq!(config.ca_bundle_mount_path, "/etc/ssl/custom-certs");
        assert_eq!(config.system_namespace, TRELLIS_SYSTEM_NAMESPACE);
    }
}

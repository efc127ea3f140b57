//! TrellisInferenceService CRD types
//!
//! Defines `TrellisInferenceService`, a declarative LLM inference service
//! reconciled into model-storage wiring, a single- or multi-node serving
//! workload, an HTTP route, and an endpoint-picker scheduler. Also defines
//! `TrellisInferenceConfig`, a reusable spec fragment merged in via base
//! references.

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result, POOL_MIGRATION_ANNOTATION, POOL_MIGRATION_V1, STOP_ANNOTATION};

// =============================================================================
// Condition types
// =============================================================================

/// Top-level readiness condition, aggregated from all component conditions
pub const CONDITION_READY: &str = "Ready";
/// Readiness of the main (decode) workload
pub const CONDITION_MAIN_WORKLOAD_READY: &str = "MainWorkloadReady";
/// Readiness of the prefill workload, present only when prefill is configured
pub const CONDITION_PREFILL_WORKLOAD_READY: &str = "PrefillWorkloadReady";
/// Readiness of the routing layer (workload service, TLS secret, HTTP route)
pub const CONDITION_ROUTER_READY: &str = "RouterReady";
/// Readiness of the endpoint-picker scheduler and its pools
pub const CONDITION_SCHEDULER_READY: &str = "SchedulerReady";

// =============================================================================
// Model
// =============================================================================

/// Request criticality, consumed by the scheduler's flow control.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum Criticality {
    /// Must not be shed; starves lower tiers under pressure
    Critical,
    /// Default tier
    Standard,
    /// First to be shed under pressure
    Sheddable,
}

/// Where the model weights live and how they are identified.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Model storage URI. Supported schemes: `pvc://`, `oci://`, `hf://`,
    /// `s3://`. Any other scheme is a configuration error.
    pub uri: String,

    /// Served model name, defaulting to the instance name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Request criticality hint for the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<Criticality>,

    /// Storage-initializer behavior for this model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInitializerSpec>,
}

impl ModelSpec {
    /// Whether storage wiring is enabled. Absent means enabled; an explicit
    /// `enabled: false` suppresses all storage wiring for every scheme.
    pub fn storage_enabled(&self) -> bool {
        self.storage
            .as_ref()
            .and_then(|s| s.enabled)
            .unwrap_or(true)
    }
}

/// Controls the model-storage wiring applied to serving pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInitializerSpec {
    /// Global kill switch for storage wiring. `None` means enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

// =============================================================================
// Parallelism
// =============================================================================

/// Parallelism degrees for the serving engine.
///
/// Pipeline or data parallelism spanning more than one pod is what selects
/// the multi-node (LeaderWorkerSet) topology together with a worker
/// template.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParallelismSpec {
    /// Tensor parallel degree (within one pod)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<i32>,

    /// Pipeline parallel degree (pods per serving group)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<i32>,

    /// Total data parallel degree across the serving group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i32>,

    /// Data parallel degree local to one pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_local: Option<i32>,

    /// Whether expert parallelism is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert: Option<bool>,
}

impl ParallelismSpec {
    /// Whether pipeline parallelism is configured
    pub fn is_pipeline_parallel(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Whether data parallelism is configured
    pub fn is_data_parallel(&self) -> bool {
        self.data.is_some() || self.data_local.is_some()
    }

    /// Number of pods per serving group.
    ///
    /// Pipeline degree wins when set; otherwise data parallelism divides
    /// the total degree by the per-pod degree (rounded up). Defaults to 1.
    pub fn group_size(&self) -> i32 {
        if let Some(pipeline) = self.pipeline {
            return pipeline.max(1);
        }
        if self.is_data_parallel() {
            let data = self.data.unwrap_or(1).max(1);
            let local = self.data_local.unwrap_or(1).max(1);
            return (data + local - 1) / local;
        }
        1
    }
}

// =============================================================================
// Workload
// =============================================================================

/// Pod topology for one serving role (main or prefill).
///
/// Flattened into the instance spec for the main workload and nested under
/// `prefill` for disaggregated prefill. A `worker` template selects the
/// multi-node (LeaderWorkerSet) topology; without one the role runs as a
/// plain Deployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Number of replicas (Deployment replicas or LeaderWorkerSet groups)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Parallelism degrees feeding the multi-node group size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<ParallelismSpec>,

    /// Pod spec for the serving (leader) pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodSpec>,

    /// Pod spec for worker pods; presence selects the multi-node topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<PodSpec>,
}

impl WorkloadSpec {
    /// Whether this role runs as a LeaderWorkerSet rather than a Deployment
    pub fn is_multi_node(&self) -> bool {
        self.worker.is_some()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Reference to a Gateway that managed routes attach to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRef {
    /// Gateway name
    pub name: String,
    /// Gateway namespace, defaulting to the instance namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Gateways the managed route binds to.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Gateway references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<GatewayRef>,
}

/// Route management for the instance.
///
/// Empty `refs` means Trellis manages an HTTPRoute; naming existing routes
/// here suppresses the managed route entirely (bring-your-own routing).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Names of user-managed HTTPRoutes in the instance namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<BaseRef>,
}

/// Endpoint-picker scheduler deployment and configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    /// Pod spec override for the endpoint-picker deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodSpec>,

    /// Endpoint-picker configuration source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SchedulerConfigSpec>,
}

/// Endpoint-picker configuration, either inline or from a ConfigMap.
///
/// Inline wins when both are set. ConfigMap references resolve in the
/// instance namespace first, then the Trellis system namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigSpec {
    /// Inline configuration document, serialized to YAML for the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Value>,

    /// ConfigMap holding the configuration document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<SchedulerConfigRef>,
}

/// ConfigMap reference for scheduler configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigRef {
    /// ConfigMap name
    pub name: String,
    /// Data key, defaulting to `config.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Request routing and scheduling for the instance.
///
/// Absent sub-specs deactivate their children: no `scheduler` means the
/// endpoint-picker deployment, its RBAC, and the inference pools are
/// garbage-collected on the next reconcile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// Gateways the managed route binds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewaySpec>,

    /// Route management (managed vs. bring-your-own)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteSpec>,

    /// Endpoint-picker scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

impl RouterSpec {
    /// Whether the user brings their own routes instead of the managed one
    pub fn has_user_routes(&self) -> bool {
        self.route.as_ref().is_some_and(|r| !r.refs.is_empty())
    }
}

/// Reference to another namespaced object by name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseRef {
    /// Referenced object name
    pub name: String,
}

// =============================================================================
// CRD
// =============================================================================

/// Declarative LLM inference service
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "TrellisInferenceService",
    plural = "trellisinferenceservices",
    shortname = "tis",
    namespaced,
    status = "TrellisInferenceServiceStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model.uri"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrellisInferenceServiceSpec {
    /// Model reference
    #[serde(default)]
    pub model: ModelSpec,

    /// Main workload topology (replicas, parallelism, pod templates)
    #[serde(default, flatten)]
    pub workload: WorkloadSpec,

    /// Disaggregated prefill workload, absent for combined serving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<WorkloadSpec>,

    /// Request routing and scheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterSpec>,

    /// Reusable config fragments merged under this spec. Later refs
    /// override earlier ones; explicit fields here override all refs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base_refs: Vec<BaseRef>,
}

/// Status of a TrellisInferenceService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrellisInferenceServiceStatus {
    /// Component and aggregate readiness conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently acted on by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Reusable spec fragment for composition via `baseRefs`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "TrellisInferenceConfig",
    plural = "trellisinferenceconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrellisInferenceConfigSpec {
    /// The spec fragment. All fields are optional overlays.
    #[serde(flatten)]
    pub fragment: TrellisInferenceServiceSpec,
}

// =============================================================================
// Annotation state machines
// =============================================================================

/// Migration state of the inference-pool API group for one instance.
///
/// The only transition is `NotMigrated` to `Migrated`; nothing reverts it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMigration {
    /// Pool references still use the legacy API group
    NotMigrated,
    /// Pool references use the new API group
    Migrated,
}

impl PoolMigration {
    /// Whether the migration has committed
    pub fn is_migrated(&self) -> bool {
        matches!(self, PoolMigration::Migrated)
    }
}

impl TrellisInferenceService {
    /// Whether the stop annotation halts this instance.
    ///
    /// Only the exact value `"true"` counts; anything else reconciles
    /// normally.
    pub fn is_stopped(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(STOP_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Read the pool-migration state from the migration annotation.
    ///
    /// Absent or unrecognized values read as not migrated.
    pub fn pool_migration(&self) -> PoolMigration {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(POOL_MIGRATION_ANNOTATION))
        {
            Some(v) if v == POOL_MIGRATION_V1 => PoolMigration::Migrated,
            _ => PoolMigration::NotMigrated,
        }
    }

    /// Commit the pool migration on this copy of the instance.
    ///
    /// This is the single transition function for the migration state
    /// machine; there is no reverse operation. Idempotent. The caller is
    /// responsible for persisting the annotation.
    pub fn mark_pool_migrated(&mut self) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                POOL_MIGRATION_ANNOTATION.to_string(),
                POOL_MIGRATION_V1.to_string(),
            );
    }

    /// Served model name, defaulting to the instance name.
    pub fn model_name(&self) -> String {
        self.spec
            .model
            .name
            .clone()
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Base-config merge
// =============================================================================

/// Merge an overlay spec onto a base spec.
///
/// Objects merge recursively and scalar or array fields from the overlay
/// replace the base. Unset overlay fields (null, empty string, empty
/// array, empty object) leave the base untouched, so a fragment that only
/// sets `parallelism` cannot wipe a template supplied by an earlier ref.
pub fn merge_specs(
    base: TrellisInferenceServiceSpec,
    overlay: &TrellisInferenceServiceSpec,
) -> Result<TrellisInferenceServiceSpec> {
    let mut base_value = serde_json::to_value(&base).map_err(|e| {
        Error::serialization_for_kind("TrellisInferenceServiceSpec", e.to_string())
    })?;
    let overlay_value = serde_json::to_value(overlay).map_err(|e| {
        Error::serialization_for_kind("TrellisInferenceServiceSpec", e.to_string())
    })?;
    deep_merge(&mut base_value, overlay_value);
    serde_json::from_value(base_value).map_err(|e| {
        Error::serialization_for_kind("TrellisInferenceServiceSpec", e.to_string())
    })
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn deep_merge(base: &mut Value, overlay: Value) {
    if is_unset(&overlay) {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if is_unset(&value) {
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Typed bindings for foreign CRDs Trellis writes but does not own.
//!
//! Gateway API HTTPRoutes, inference pools in both API generations, and
//! LeaderWorkerSets. These CRDs are installed by their own projects, so
//! schema generation is disabled and the shapes here are partial: only the
//! fields Trellis reads or writes are bound, unknown fields pass through
//! deserialization untouched.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::kube_utils::has_condition;

/// API group of the legacy inference-pool generation
pub const LEGACY_POOL_GROUP: &str = "inference.networking.x-k8s.io";
/// API group of the current inference-pool generation
pub const POOL_GROUP: &str = "inference.networking.k8s.io";
/// API group of Gateway API resources
pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// LeaderWorkerSet startup policy: create the leader first, workers after
pub const STARTUP_POLICY_LEADER_CREATED: &str = "LeaderCreated";
/// LeaderWorkerSet restart policy: restart the whole group on any pod failure
pub const RESTART_POLICY_RECREATE_GROUP: &str = "RecreateGroupOnPodRestart";

/// Condition type a pool controller sets once it accepts the pool
pub const POOL_CONDITION_ACCEPTED: &str = "Accepted";

// =============================================================================
// HTTPRoute (gateway.networking.k8s.io/v1)
// =============================================================================

/// Gateway API HTTPRoute spec (partial binding)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "HTTPRoute",
    plural = "httproutes",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteSpec {
    /// Gateways this route attaches to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<ParentReference>,

    /// Hostnames the route matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// Matching and forwarding rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<HTTPRouteRule>,
}

/// Reference from a route to the Gateway it attaches to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    /// API group of the parent, defaulting to the Gateway API group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind of the parent, defaulting to Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Parent name
    pub name: String,
    /// Parent namespace, defaulting to the route's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Listener section within the parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
}

/// A single match-and-forward rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteRule {
    /// Request match conditions (OR semantics)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HTTPRouteMatch>,

    /// Where matching requests are forwarded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_refs: Vec<HTTPBackendRef>,
}

/// Request match condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRouteMatch {
    /// Path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HTTPPathMatch>,
}

/// Path match condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HTTPPathMatch {
    /// Match type (PathPrefix, Exact)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Path value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Backend a route rule forwards to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HTTPBackendRef {
    /// API group of the backend; empty for core Services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind of the backend, defaulting to Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Backend name
    pub name: String,
    /// Backend namespace, defaulting to the route's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Backend port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Traffic weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

// =============================================================================
// InferencePool, legacy generation (inference.networking.x-k8s.io/v1alpha2)
// =============================================================================

mod legacy {
    use super::*;

    /// Legacy-generation inference pool spec (partial binding)
    #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[kube(
        group = "inference.networking.x-k8s.io",
        version = "v1alpha2",
        kind = "InferencePool",
        plural = "inferencepools",
        namespaced,
        schema = "disabled"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct InferencePoolSpec {
        /// Label selector over serving pods (flat map in this generation)
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        pub selector: BTreeMap<String, String>,

        /// Serving port on the selected pods
        pub target_port_number: i32,

        /// The endpoint-picker extension handling this pool
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub extension_ref: Option<ExtensionReference>,
    }

    /// Reference to the endpoint-picker extension service
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct ExtensionReference {
        /// API group of the extension; empty for core Services
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub group: Option<String>,
        /// Kind of the extension, defaulting to Service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub kind: Option<String>,
        /// Extension service name
        pub name: String,
        /// Extension service port
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub port_number: Option<i32>,
    }
}

pub use legacy::{
    ExtensionReference, InferencePool as InferencePoolLegacy,
    InferencePoolSpec as InferencePoolLegacySpec,
};

// =============================================================================
// InferencePool, current generation (inference.networking.k8s.io/v1)
// =============================================================================

mod pool_v1 {
    use super::*;

    /// Current-generation inference pool spec (partial binding)
    #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[kube(
        group = "inference.networking.k8s.io",
        version = "v1",
        kind = "InferencePool",
        plural = "inferencepools",
        namespaced,
        status = "InferencePoolStatus",
        schema = "disabled"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct InferencePoolSpec {
        /// Label selector over serving pods
        #[serde(default)]
        pub selector: PoolSelector,

        /// Serving ports on the selected pods
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub target_ports: Vec<PoolPort>,

        /// The endpoint-picker extension handling this pool
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub endpoint_picker_ref: Option<EndpointPickerRef>,
    }

    /// Label selector wrapper used by the current pool generation
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct PoolSelector {
        /// Labels the serving pods must carry
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        pub match_labels: BTreeMap<String, String>,
    }

    /// A numbered port
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct PoolPort {
        /// Port number
        pub number: i32,
    }

    /// Reference to the endpoint-picker extension service
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct EndpointPickerRef {
        /// API group of the extension; empty for core Services
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub group: Option<String>,
        /// Kind of the extension, defaulting to Service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub kind: Option<String>,
        /// Extension service name
        pub name: String,
        /// Extension service port
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub port: Option<PoolPort>,
    }

    /// Pool status as reported by the pool controller (partial binding)
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct InferencePoolStatus {
        /// Per-parent acceptance status
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub parents: Vec<PoolParentStatus>,
    }

    /// Status reported by one parent (gateway) for this pool
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct PoolParentStatus {
        /// Conditions reported by the parent
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub conditions: Vec<Condition>,
    }

    impl InferencePool {
        /// Whether any parent has accepted this pool.
        ///
        /// This is the health signal gating the pool API migration.
        pub fn is_accepted(&self) -> bool {
            self.status
                .as_ref()
                .map(|s| {
                    s.parents.iter().any(|p| {
                        has_condition(Some(p.conditions.as_slice()), POOL_CONDITION_ACCEPTED)
                    })
                })
                .unwrap_or(false)
        }
    }
}

pub use pool_v1::{
    EndpointPickerRef, InferencePool, InferencePoolSpec, InferencePoolStatus, PoolParentStatus,
    PoolPort, PoolSelector,
};

// =============================================================================
// LeaderWorkerSet (leaderworkerset.x-k8s.io/v1)
// =============================================================================

/// LeaderWorkerSet spec (partial binding)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "leaderworkerset.x-k8s.io",
    version = "v1",
    kind = "LeaderWorkerSet",
    plural = "leaderworkersets",
    namespaced,
    status = "LeaderWorkerSetStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetSpec {
    /// Number of serving groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Group startup ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_policy: Option<String>,

    /// Leader and worker pod templates for each group
    #[serde(default)]
    pub leader_worker_template: LeaderWorkerTemplate,
}

/// Pod templates and sizing for one serving group
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerTemplate {
    /// Pods per group, leader included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,

    /// Group restart behavior
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,

    /// Leader pod template; workers use `worker_template` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_template: Option<PodTemplateSpec>,

    /// Worker pod template
    #[serde(default)]
    pub worker_template: PodTemplateSpec,

    /// Nested subgroup sizing for data-parallel groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_group_policy: Option<SubGroupPolicy>,
}

/// Subgroup partitioning of one serving group
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubGroupPolicy {
    /// Pods per subgroup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_group_size: Option<i32>,
}

/// LeaderWorkerSet status (partial binding)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetStatus {
    /// Standard conditions (Available, Progressing)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Groups with all pods ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
}

impl LeaderWorkerSet {
    /// Whether the set reports the Available condition true
    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                has_condition(
                    Some(s.conditions.as_slice()),
                    crate::kube_utils::CONDITION_AVAILABLE,
                )
            })
            .unwrap_or(false)
    }
}

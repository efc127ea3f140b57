//! Serving workload construction
//!
//! Each role (main, prefill) runs either as a Deployment or, when a worker
//! pod template is present, as a LeaderWorkerSet. Builders here are pure:
//! the reconcile pipeline prepares pod specs (identity, model storage)
//! first and passes them in, then drives the built children through the
//! engine and lifts their availability into instance conditions.

pub mod multi_node;
pub mod single_node;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use trellis_common::crd::networking::LeaderWorkerSet;
use trellis_common::crd::TrellisInferenceService;
use trellis_common::kube_utils::{child_name, CONDITION_AVAILABLE, STATUS_TRUE};
use trellis_common::{LABEL_COMPONENT, LABEL_NAME, LABEL_PART_OF, LABEL_ROLE, PART_OF_VALUE};

use crate::identity::WorkloadRole;

/// Role label on pods that serve decode traffic
pub const ROLE_DECODE: &str = "decode";
/// Role label on pods that serve prefill traffic
pub const ROLE_PREFILL: &str = "prefill";
/// Role label when one workload serves both phases
pub const ROLE_BOTH: &str = "both";

const CONDITION_PROGRESSING: &str = "Progressing";

/// Name of the role's single-node Deployment.
pub fn deployment_name(instance: &TrellisInferenceService, role: WorkloadRole) -> String {
    match role {
        WorkloadRole::Main => child_name(&instance.name_any(), "-workload"),
        WorkloadRole::Prefill => child_name(&instance.name_any(), "-workload-prefill"),
    }
}

/// Name of the role's multi-node LeaderWorkerSet.
pub fn lws_name(instance: &TrellisInferenceService, role: WorkloadRole) -> String {
    match role {
        WorkloadRole::Main => child_name(&instance.name_any(), "-mn"),
        WorkloadRole::Prefill => child_name(&instance.name_any(), "-mn-prefill"),
    }
}

/// Component label value for the role's serving pods.
pub fn component(role: WorkloadRole) -> &'static str {
    match role {
        WorkloadRole::Main => "workload",
        WorkloadRole::Prefill => "workload-prefill",
    }
}

fn worker_component(role: WorkloadRole) -> &'static str {
    match role {
        WorkloadRole::Main => "workload-worker",
        WorkloadRole::Prefill => "workload-worker-prefill",
    }
}

/// Role label value; the main role serves both phases until a prefill
/// workload takes the prefill half.
pub fn role_value(instance: &TrellisInferenceService, role: WorkloadRole) -> &'static str {
    match role {
        WorkloadRole::Main if instance.spec.prefill.is_some() => ROLE_DECODE,
        WorkloadRole::Main => ROLE_BOTH,
        WorkloadRole::Prefill => ROLE_PREFILL,
    }
}

/// Stable selector labels for the role's workload.
///
/// Deliberately excludes the role label: the role value flips between
/// `both` and `decode` when prefill is added or removed, and selectors
/// are immutable once a Deployment exists.
pub fn selector_labels(
    instance: &TrellisInferenceService,
    role: WorkloadRole,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), instance.name_any()),
        (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
        (LABEL_COMPONENT.to_string(), component(role).to_string()),
    ])
}

/// Labels on the role's serving pods: the selector plus the role label
/// the inference pool matches traffic on.
pub fn serving_labels(
    instance: &TrellisInferenceService,
    role: WorkloadRole,
) -> BTreeMap<String, String> {
    let mut labels = selector_labels(instance, role);
    labels.insert(LABEL_ROLE.to_string(), role_value(instance, role).to_string());
    labels
}

// ===== Status propagation =====

/// Readiness lifted from a live child workload's Available condition.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadReadiness {
    /// Whether the child reports Available=True
    pub ready: bool,
    /// Condition reason to surface on the instance
    pub reason: String,
    /// Condition message to surface on the instance
    pub message: String,
}

impl WorkloadReadiness {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: CONDITION_AVAILABLE.to_string(),
            message: String::new(),
        }
    }

    fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// A child with no Available condition yet is still rolling out.
    fn progressing() -> Self {
        Self::not_ready(CONDITION_PROGRESSING, "")
    }
}

/// Lift a Deployment's Available condition into a readiness summary.
pub fn deployment_readiness(current: Option<&Deployment>) -> WorkloadReadiness {
    let Some(current) = current else {
        return WorkloadReadiness::progressing();
    };
    let available = current
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .find(|c| c.type_ == CONDITION_AVAILABLE);
    match available {
        Some(condition) if condition.status == STATUS_TRUE => WorkloadReadiness::ready(),
        Some(condition) => WorkloadReadiness::not_ready(
            condition.reason.clone().unwrap_or_default(),
            condition.message.clone().unwrap_or_default(),
        ),
        None => WorkloadReadiness::progressing(),
    }
}

/// Lift a LeaderWorkerSet's Available condition into a readiness summary.
pub fn lws_readiness(current: Option<&LeaderWorkerSet>) -> WorkloadReadiness {
    let Some(current) = current else {
        return WorkloadReadiness::progressing();
    };
    let available = current
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .into_iter()
        .flatten()
        .find(|c| c.type_ == CONDITION_AVAILABLE);
    match available {
        Some(condition) if condition.status == STATUS_TRUE => WorkloadReadiness::ready(),
        Some(condition) => {
            WorkloadReadiness::not_ready(condition.reason.clone(), condition.message.clone())
        }
        None => WorkloadReadiness::progressing(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use trellis_common::crd::networking::LeaderWorkerSetStatus;
    use trellis_common::crd::{
        ModelSpec, TrellisInferenceServiceSpec, WorkloadSpec,
    };
    use trellis_common::kube_utils::new_condition;

    fn instance() -> TrellisInferenceService {
        let mut instance = TrellisInferenceService::new(
            "llama",
            TrellisInferenceServiceSpec {
                model: ModelSpec {
                    uri: "hf://meta/llama".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("ml".to_string());
        instance
    }

    #[test]
    fn child_names_per_role() {
        let tis = instance();
        assert_eq!(deployment_name(&tis, WorkloadRole::Main), "llama-workload");
        assert_eq!(
            deployment_name(&tis, WorkloadRole::Prefill),
            "llama-workload-prefill"
        );
        assert_eq!(lws_name(&tis, WorkloadRole::Main), "llama-mn");
        assert_eq!(lws_name(&tis, WorkloadRole::Prefill), "llama-mn-prefill");
    }

    #[test]
    fn main_role_serves_both_until_prefill_exists() {
        let mut tis = instance();
        assert_eq!(role_value(&tis, WorkloadRole::Main), ROLE_BOTH);

        tis.spec.prefill = Some(WorkloadSpec::default());
        assert_eq!(role_value(&tis, WorkloadRole::Main), ROLE_DECODE);
        assert_eq!(role_value(&tis, WorkloadRole::Prefill), ROLE_PREFILL);
    }

    #[test]
    fn selector_labels_stay_stable_across_role_changes() {
        let mut tis = instance();
        let before = selector_labels(&tis, WorkloadRole::Main);
        tis.spec.prefill = Some(WorkloadSpec::default());
        assert_eq!(selector_labels(&tis, WorkloadRole::Main), before);
        assert!(!before.contains_key(LABEL_ROLE));

        let pods = serving_labels(&tis, WorkloadRole::Main);
        assert_eq!(pods.get(LABEL_ROLE).map(String::as_str), Some(ROLE_DECODE));
    }

    #[test]
    fn deployment_readiness_follows_available_condition() {
        assert_eq!(deployment_readiness(None), WorkloadReadiness::progressing());

        let mut deployment = Deployment::default();
        assert_eq!(
            deployment_readiness(Some(&deployment)),
            WorkloadReadiness::progressing()
        );

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: STATUS_TRUE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(deployment_readiness(Some(&deployment)).ready);

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: "False".to_string(),
                reason: Some("MinimumReplicasUnavailable".to_string()),
                message: Some("0/2 replicas available".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let readiness = deployment_readiness(Some(&deployment));
        assert!(!readiness.ready);
        assert_eq!(readiness.reason, "MinimumReplicasUnavailable");
        assert_eq!(readiness.message, "0/2 replicas available");
    }

    #[test]
    fn lws_readiness_follows_available_condition() {
        let mut lws = LeaderWorkerSet::new("llama-mn", Default::default());
        assert_eq!(lws_readiness(Some(&lws)), WorkloadReadiness::progressing());

        lws.status = Some(LeaderWorkerSetStatus {
            conditions: vec![new_condition(
                CONDITION_AVAILABLE,
                true,
                "AllGroupsReady",
                "",
                None,
            )],
            ready_replicas: Some(2),
        });
        assert!(lws_readiness(Some(&lws)).ready);
    }
}

//! Single-node serving: one Deployment per role

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use trellis_common::crd::TrellisInferenceService;
use trellis_common::kube_utils::child_metadata;
use trellis_common::LABEL_ROLE;

use crate::identity::WorkloadRole;

use super::{component, deployment_name, role_value, selector_labels, serving_labels};

/// Build the role's Deployment around an already-prepared pod spec.
pub fn deployment(
    instance: &TrellisInferenceService,
    role: WorkloadRole,
    pod_spec: PodSpec,
) -> Deployment {
    let name = deployment_name(instance, role);
    let mut metadata = child_metadata(instance, &name, component(role));
    if let Some(labels) = metadata.labels.as_mut() {
        labels.insert(
            LABEL_ROLE.to_string(),
            role_value(instance, role).to_string(),
        );
    }

    let replicas = role.workload_spec(instance).and_then(|s| s.replicas);

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(selector_labels(instance, role)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(serving_labels(instance, role)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

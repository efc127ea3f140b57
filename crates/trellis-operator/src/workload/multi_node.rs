//! Multi-node serving: one LeaderWorkerSet per role
//!
//! Every serving group restarts as a unit (weights are sharded across the
//! group, a lone restarted pod would rejoin with stale peers) and workers
//! wait for their leader. Without a leader template the workers themselves
//! are the serving pods and take the role labels the inference pool
//! selects on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use trellis_common::crd::networking::{
    LeaderWorkerSet, LeaderWorkerSetSpec, LeaderWorkerTemplate, SubGroupPolicy,
    RESTART_POLICY_RECREATE_GROUP, STARTUP_POLICY_LEADER_CREATED,
};
use trellis_common::crd::TrellisInferenceService;
use trellis_common::kube_utils::child_metadata;
use trellis_common::{LABEL_COMPONENT, LABEL_NAME, LABEL_PART_OF, PART_OF_VALUE};

use crate::identity::WorkloadRole;

use super::{component, lws_name, serving_labels, worker_component};

/// Instance annotations with these prefixes flow down to the set and its
/// pod templates (topology spread, secondary networks).
const PROPAGATED_ANNOTATION_PREFIXES: [&str; 2] =
    ["leaderworkerset.sigs.k8s.io", "k8s.v1.cni.cncf.io"];

/// Build the role's LeaderWorkerSet around already-prepared pod specs.
///
/// The worker spec is what makes the role multi-node; the leader spec is
/// optional and workers serve directly when it is absent.
pub fn leader_worker_set(
    instance: &TrellisInferenceService,
    role: WorkloadRole,
    leader: Option<PodSpec>,
    worker: PodSpec,
) -> LeaderWorkerSet {
    let name = lws_name(instance, role);
    let spec = role.workload_spec(instance);
    let parallelism = spec.and_then(|s| s.parallelism.as_ref());
    let size = parallelism.map(|p| p.group_size());
    let has_leader = leader.is_some();

    let worker_labels = if has_leader {
        BTreeMap::from([
            (LABEL_NAME.to_string(), instance.name_any()),
            (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
            (LABEL_COMPONENT.to_string(), worker_component(role).to_string()),
        ])
    } else {
        serving_labels(instance, role)
    };

    // Prefill shards data-parallel ranks into subgroups of one serving group
    let sub_group_policy = (role == WorkloadRole::Prefill
        && parallelism.is_some_and(|p| p.is_data_parallel()))
    .then(|| SubGroupPolicy {
        sub_group_size: size,
    });

    let mut lws = LeaderWorkerSet {
        metadata: child_metadata(instance, &name, component(role)),
        spec: LeaderWorkerSetSpec {
            replicas: spec.and_then(|s| s.replicas),
            startup_policy: Some(STARTUP_POLICY_LEADER_CREATED.to_string()),
            leader_worker_template: LeaderWorkerTemplate {
                size,
                restart_policy: Some(RESTART_POLICY_RECREATE_GROUP.to_string()),
                leader_template: leader.map(|leader_spec| PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(serving_labels(instance, role)),
                        ..Default::default()
                    }),
                    spec: Some(leader_spec),
                }),
                worker_template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(worker_labels),
                        ..Default::default()
                    }),
                    spec: Some(worker),
                },
                sub_group_policy,
            },
        },
        status: None,
    };
    propagate_annotations(instance, &mut lws);
    lws
}

fn propagate_annotations(instance: &TrellisInferenceService, lws: &mut LeaderWorkerSet) {
    let propagated: BTreeMap<String, String> = instance
        .annotations()
        .iter()
        .filter(|(key, _)| {
            PROPAGATED_ANNOTATION_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if propagated.is_empty() {
        return;
    }

    merge_annotations(&mut lws.metadata, &propagated);
    if let Some(leader) = lws.spec.leader_worker_template.leader_template.as_mut() {
        merge_annotations(leader.metadata.get_or_insert_with(Default::default), &propagated);
    }
    merge_annotations(
        lws.spec
            .leader_worker_template
            .worker_template
            .metadata
            .get_or_insert_with(Default::default),
        &propagated,
    );
}

fn merge_annotations(metadata: &mut ObjectMeta, extra: &BTreeMap<String, String>) {
    let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in extra {
        annotations.insert(key.clone(), value.clone());
    }
}

//! Managed service-account lifecycle for workload pods
//!
//! Multi-node groups run under a per-role service account so leader and
//! worker pods share one identity. The account is controller-managed only
//! when the user did not name one explicitly: an explicit name always
//! passes through untouched, and a managed account is retired as soon as
//! its role drops back to single-node (or, for prefill, disappears).

use k8s_openapi::api::core::v1::{PodSpec, ServiceAccount};
use kube::ResourceExt;

use trellis_common::crd::{TrellisInferenceService, WorkloadSpec};
use trellis_common::kube_utils::{child_metadata, child_name};

const COMPONENT: &str = "identity";

/// Workload role a topology or identity decision applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadRole {
    /// The decode (or combined) workload
    Main,
    /// The disaggregated prefill workload
    Prefill,
}

impl WorkloadRole {
    /// Both roles, in the order the pipeline visits them.
    pub const ALL: [WorkloadRole; 2] = [WorkloadRole::Main, WorkloadRole::Prefill];

    /// The role's workload spec, when the role is configured at all.
    pub fn workload_spec<'a>(
        &self,
        instance: &'a TrellisInferenceService,
    ) -> Option<&'a WorkloadSpec> {
        match self {
            WorkloadRole::Main => Some(&instance.spec.workload),
            WorkloadRole::Prefill => instance.spec.prefill.as_ref(),
        }
    }

    /// Name of the controller-managed service account for this role.
    pub fn managed_account_name(&self, instance: &TrellisInferenceService) -> String {
        match self {
            WorkloadRole::Main => child_name(&instance.name_any(), "-sa"),
            WorkloadRole::Prefill => child_name(&instance.name_any(), "-prefill-sa"),
        }
    }
}

/// Outcome of the identity decision table for one role.
#[derive(Clone, Debug, PartialEq)]
pub enum IdentityPlan {
    /// User-supplied account name; managed accounts are never touched
    Explicit(String),
    /// Role is active without an explicit name: reconcile this account
    Managed(Box<ServiceAccount>),
    /// Role is inactive: delete the managed account if it exists
    Retire(String),
}

/// Evaluate the identity decision table for one role.
///
/// A role is active when it runs multi-node, i.e. a worker template is
/// present. The single-node path runs under whatever the pod template
/// names, or the namespace default account.
pub fn plan(instance: &TrellisInferenceService, role: WorkloadRole) -> IdentityPlan {
    let spec = role.workload_spec(instance);
    let explicit = spec
        .and_then(|s| s.template.as_ref())
        .and_then(|t| t.service_account_name.as_deref())
        .filter(|name| !name.is_empty());
    if let Some(name) = explicit {
        return IdentityPlan::Explicit(name.to_string());
    }

    let name = role.managed_account_name(instance);
    if spec.is_some_and(WorkloadSpec::is_multi_node) {
        IdentityPlan::Managed(Box::new(ServiceAccount {
            metadata: child_metadata(instance, &name, COMPONENT),
            ..Default::default()
        }))
    } else {
        IdentityPlan::Retire(name)
    }
}

/// Run the role's pods under the managed account.
///
/// Pod specs that already name an account keep it.
pub fn apply(plan: &IdentityPlan, pod_specs: &mut [&mut PodSpec]) {
    let IdentityPlan::Managed(account) = plan else {
        return;
    };
    let Some(name) = account.metadata.name.as_deref() else {
        return;
    };
    for pod_spec in pod_specs {
        let unset = pod_spec
            .service_account_name
            .as_deref()
            .map_or(true, str::is_empty);
        if unset {
            pod_spec.service_account_name = Some(name.to_string());
        }
    }
}

//! Shared Kubernetes utilities using kube-rs
//!
//! Child naming, controller ownership, condition bookkeeping, and status
//! patching used by every Trellis sub-reconciler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, OwnerReference, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;

// =============================================================================
// Child naming
// =============================================================================

/// Maximum length of a DNS-1123 label, the limit for most resource names.
const MAX_NAME_LEN: usize = 63;

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function must be used whenever the hash is persisted (names, annotations).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Derive a child resource name from its parent's name and a fixed suffix.
///
/// `base + suffix` is used directly when it fits in a DNS label. Longer
/// names are shortened deterministically: the base is truncated and an
/// 8-char hash of the full base is inserted so distinct parents can never
/// collide after truncation.
pub fn child_name(base: &str, suffix: &str) -> String {
    if base.len() + suffix.len() <= MAX_NAME_LEN {
        return format!("{}{}", base, suffix);
    }
    let hash = deterministic_hash(base);
    let short_hash = &hash[..8];
    // prefix + "-" + hash8 + suffix == 63
    let keep = MAX_NAME_LEN - suffix.len() - short_hash.len() - 1;
    format!("{}-{}{}", &base[..keep], short_hash, suffix)
}

// =============================================================================
// Ownership
// =============================================================================

/// Find the controller owner reference on a resource, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Check whether `meta` is controlled by the given owner.
///
/// Matches by UID when both sides carry one; falls back to kind + name so
/// tests can build owners without server-assigned UIDs.
pub fn is_controlled_by<O>(meta: &ObjectMeta, owner: &O) -> bool
where
    O: Resource<DynamicType = ()>,
{
    let Some(controller) = controller_of(meta) else {
        return false;
    };
    if let (Some(owner_uid), uid) = (owner.meta().uid.as_deref(), controller.uid.as_str()) {
        if !uid.is_empty() {
            return owner_uid == uid;
        }
    }
    controller.kind == O::kind(&()).as_ref()
        && Some(controller.name.as_str()) == owner.meta().name.as_deref()
}

/// Build the standard metadata for a managed child resource.
///
/// Attaches the controller owner reference plus the labels that tie the
/// child back to its instance (`app.kubernetes.io/name`, `part-of`, and
/// the component label).
pub fn child_metadata<O>(owner: &O, name: &str, component: &str) -> ObjectMeta
where
    O: Resource<DynamicType = ()>,
{
    let owner_name = owner.meta().name.clone().unwrap_or_default();
    let mut labels = BTreeMap::new();
    labels.insert(crate::LABEL_NAME.to_string(), owner_name);
    labels.insert(crate::LABEL_COMPONENT.to_string(), component.to_string());
    labels.insert(
        crate::LABEL_PART_OF.to_string(),
        crate::PART_OF_VALUE.to_string(),
    );
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.meta().namespace.clone(),
        labels: Some(labels),
        owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// The "Available" condition type reported by Deployments and LeaderWorkerSets
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";
/// The "False" status value for conditions
pub const STATUS_FALSE: &str = "False";

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for Condition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Build a metav1 Condition with the current timestamp.
pub fn new_condition(
    condition_type: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: condition_type.to_string(),
        status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/// Upsert a condition by type.
///
/// The transition timestamp only moves when the status actually changes;
/// reason/message/observedGeneration refresh either way. Matches the
/// apimachinery `SetStatusCondition` contract so `kubectl wait` behaves.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            let transition_time = if existing.status == new.status {
                existing.last_transition_time.clone()
            } else {
                new.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..new
            };
        }
        None => conditions.push(new),
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

// =============================================================================
// Status patching
// =============================================================================

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. Returns `kube::Error` so callers can map to their own
/// error type.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patch a single metadata annotation on a namespaced resource.
///
/// Used for controller-owned out-of-band state (the pool-migration flag)
/// where a full spec update would fight the user's own writes.
pub async fn patch_annotation<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
    value: &str,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": { "annotations": { key: value } }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentCondition;

    #[test]
    fn short_names_pass_through() {
        assert_eq!(child_name("llama", "-workload"), "llama-workload");
        assert_eq!(child_name("llama", "-mn"), "llama-mn");
    }

    #[test]
    fn long_names_are_shortened_to_dns_limit() {
        let base = "a".repeat(80);
        let name = child_name(&base, "-workload-prefill");
        assert!(name.len() <= 63, "{} is too long", name.len());
        assert!(name.ends_with("-workload-prefill"));
    }

    #[test]
    fn shortened_names_are_deterministic_and_distinct() {
        let base_a = format!("{}a", "x".repeat(79));
        let base_b = format!("{}b", "x".repeat(79));
        assert_eq!(child_name(&base_a, "-pool"), child_name(&base_a, "-pool"));
        // Same truncation prefix, different hash
        assert_ne!(child_name(&base_a, "-pool"), child_name(&base_b, "-pool"));
    }

    #[test]
    fn deterministic_hash_is_stable() {
        assert_eq!(deterministic_hash("abc"), deterministic_hash("abc"));
        assert_eq!(deterministic_hash("abc").len(), 16);
        assert_ne!(deterministic_hash("abc"), deterministic_hash("abd"));
    }

    #[test]
    fn has_condition_checks_type_and_status() {
        let conditions = vec![DeploymentCondition {
            type_: "Available".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }];
        assert!(has_condition(Some(&conditions[..]), CONDITION_AVAILABLE));
        assert!(!has_condition(Some(&conditions[..]), "Progressing"));
        assert!(!has_condition::<DeploymentCondition>(None, CONDITION_AVAILABLE));
    }

    #[test]
    fn set_condition_preserves_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            new_condition("Ready", true, "AllReady", "", Some(1)),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        // Same status, newer generation: timestamp must not move
        set_condition(
            &mut conditions,
            new_condition("Ready", true, "AllReady", "", Some(2)),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].observed_generation, Some(2));

        // Status flip: timestamp moves
        set_condition(
            &mut conditions,
            new_condition("Ready", false, "Stopped", "stop annotation set", Some(3)),
        );
        assert_eq!(conditions[0].status, STATUS_FALSE);
        assert_eq!(conditions[0].reason, "Stopped");
    }

    #[test]
    fn set_condition_appends_new_types() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            new_condition("MainWorkloadReady", true, "Available", "", None),
        );
        set_condition(
            &mut conditions,
            new_condition("RouterReady", true, "RouteReady", "", None),
        );
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "RouterReady").is_some());
        assert!(find_condition(&conditions, "SchedulerReady").is_none());
    }

    #[test]
    fn controller_of_requires_controller_flag() {
        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "trellis.dev/v1alpha1".to_string(),
                kind: "TrellisInferenceService".to_string(),
                name: "llama".to_string(),
                uid: "abc-123".to_string(),
                controller: Some(false),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(controller_of(&meta).is_none());
    }
}

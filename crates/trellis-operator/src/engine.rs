//! Generic CRUD engine for managed child resources
//!
//! Every sub-resource reconciler (workload, router, scheduler, identity)
//! goes through this engine rather than talking to the API server directly.
//! The engine enforces the ownership rule: a child is only mutated or
//! deleted by the instance that controls it, and a foreign object with a
//! colliding name is never touched.
//!
//! Updates run a server dry-run first so the semantic comparison sees the
//! object as it would actually be stored (defaulting webhooks applied),
//! which is what lets reconciles converge to zero writes.

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use trellis_common::events::{actions, reasons, EventPublisher};
use trellis_common::kube_utils::is_controlled_by;
use trellis_common::{Error, Result, FIELD_MANAGER};

/// Immediate re-fetch attempts after a resource-version conflict.
const UPDATE_CONFLICT_RETRIES: usize = 3;

/// Bounds every managed child kind satisfies.
pub trait ChildResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
{
}

impl<T> ChildResource for T where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
{
}

/// Semantic equality between the dry-run-adjusted desired object and the
/// live one. Returning true suppresses the real write.
pub type EqualityFn<T> = fn(&T, &T) -> bool;

/// Adjustment applied to the dry-run result before comparison and write.
/// Arguments are (projected desired, live current).
pub type PostDryRunHook<T> = fn(&mut T, &T);

/// Per-kind update behavior.
///
/// The equality function decides what "already converged" means for a kind
/// (typically spec + labels + annotations), and the optional hook preserves
/// live fields the operator does not own, such as a replica count scaled by
/// an external autoscaler.
pub struct ChildPolicy<T> {
    equals: EqualityFn<T>,
    post_dry_run: Option<PostDryRunHook<T>>,
}

impl<T> ChildPolicy<T> {
    /// Policy that compares with the given equality function.
    pub fn new(equals: EqualityFn<T>) -> Self {
        Self {
            equals,
            post_dry_run: None,
        }
    }

    /// Add a post-dry-run adjustment hook.
    pub fn with_post_dry_run(mut self, hook: PostDryRunHook<T>) -> Self {
        self.post_dry_run = Some(hook);
        self
    }

    /// Policy that never updates an existing object.
    ///
    /// Used for the TLS secret: the certificate is generated once and must
    /// not be rotated on every reconcile.
    pub fn create_only() -> Self {
        Self {
            equals: |_, _| true,
            post_dry_run: None,
        }
    }
}

/// Ownership-checked CRUD operations shared by all child reconcilers.
pub struct ResourceEngine {
    client: Client,
    events: Arc<dyn EventPublisher>,
    field_manager: String,
}

impl ResourceEngine {
    /// Create an engine over the given client.
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            events,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    /// The underlying Kubernetes client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The event publisher used for child lifecycle events.
    pub fn events(&self) -> &Arc<dyn EventPublisher> {
        &self.events
    }

    fn api_for<T: ChildResource>(&self, namespace: &str) -> Api<T> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Fetch a namespaced object, mapping not-found to `None`.
    pub async fn get<T: ChildResource>(&self, name: &str, namespace: &str) -> Result<Option<T>> {
        let api = self.api_for::<T>(namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::get_failed(T::kind(&()).as_ref(), namespace, name, e))
    }

    /// Fetch an object, retrying in a fallback namespace on not-found.
    ///
    /// Used for configuration objects that may live either next to the
    /// instance or in the system namespace.
    pub async fn get_with_fallback<T: ChildResource>(
        &self,
        name: &str,
        namespace: &str,
        fallback_namespace: &str,
    ) -> Result<Option<T>> {
        if let Some(found) = self.get::<T>(name, namespace).await? {
            return Ok(Some(found));
        }
        if namespace == fallback_namespace {
            return Ok(None);
        }
        self.get::<T>(name, fallback_namespace).await
    }

    /// Create a child, emitting a `Created` event attributed to the owner.
    pub async fn create<T, O>(&self, desired: &T, owner: Option<&O>) -> Result<T>
    where
        T: ChildResource,
        O: Resource<DynamicType = ()> + Send + Sync,
    {
        let (name, namespace) = object_keys(desired)?;
        let kind = T::kind(&());
        let api = self.api_for::<T>(&namespace);

        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        let created = api
            .create(&params, desired)
            .await
            .map_err(|e| Error::create_failed(kind.as_ref(), &namespace, &name, e))?;

        info!(kind = %kind, namespace = %namespace, name = %name, "created child resource");
        self.publish(
            owner,
            EventType::Normal,
            reasons::CREATED,
            actions::CREATE,
            format!("Created {} {}/{}", kind, namespace, name),
        )
        .await;
        Ok(created)
    }

    /// Update a child if the dry-run-adjusted desired state differs from
    /// the live object.
    ///
    /// Ownership is verified first when an owner is supplied. The desired
    /// object is pushed through a dry-run write so server defaulting lands
    /// before the comparison; when the policy's equality holds, no real
    /// write is issued and no event fires. Resource-version conflicts are
    /// re-fetched and retried a bounded number of times.
    pub async fn update<T, O>(
        &self,
        mut desired: T,
        current: &T,
        owner: Option<&O>,
        policy: &ChildPolicy<T>,
    ) -> Result<T>
    where
        T: ChildResource,
        O: Resource<DynamicType = ()> + Send + Sync,
    {
        let (name, namespace) = object_keys(&desired)?;
        let kind = T::kind(&());
        self.check_ownership(current, owner, kind.as_ref(), &namespace, &name)?;

        let api = self.api_for::<T>(&namespace);

        // Replace requires the current resource version.
        desired.meta_mut().resource_version = current.meta().resource_version.clone();

        let dry_run = PostParams {
            dry_run: true,
            field_manager: Some(self.field_manager.clone()),
        };
        let mut projected = api
            .replace(&name, &dry_run, &desired)
            .await
            .map_err(|e| Error::dry_run_failed(kind.as_ref(), &namespace, &name, e))?;

        if let Some(hook) = policy.post_dry_run {
            hook(&mut projected, current);
        }

        if (policy.equals)(&projected, current) {
            debug!(kind = %kind, namespace = %namespace, name = %name, "child resource unchanged");
            return Ok(current.clone());
        }

        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        let mut attempt = 0;
        loop {
            match api.replace(&name, &params, &projected).await {
                Ok(updated) => {
                    info!(kind = %kind, namespace = %namespace, name = %name, "updated child resource");
                    self.publish(
                        owner,
                        EventType::Normal,
                        reasons::UPDATED,
                        actions::UPDATE,
                        format!("Updated {} {}/{}", kind, namespace, name),
                    )
                    .await;
                    return Ok(updated);
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < UPDATE_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(
                        kind = %kind,
                        namespace = %namespace,
                        name = %name,
                        attempt,
                        "conflict updating child resource, re-fetching"
                    );
                    let live = api
                        .get(&name)
                        .await
                        .map_err(|e| Error::get_failed(kind.as_ref(), &namespace, &name, e))?;
                    projected.meta_mut().resource_version = live.meta().resource_version.clone();
                }
                Err(e) => {
                    return Err(Error::update_failed(kind.as_ref(), &namespace, &name, e));
                }
            }
        }
    }

    /// Get-then-create-or-update. Returns the live object as stored.
    pub async fn reconcile<T, O>(
        &self,
        desired: T,
        owner: Option<&O>,
        policy: &ChildPolicy<T>,
    ) -> Result<T>
    where
        T: ChildResource,
        O: Resource<DynamicType = ()> + Send + Sync,
    {
        let (name, namespace) = object_keys(&desired)?;
        match self.get::<T>(&name, &namespace).await? {
            None => self.create(&desired, owner).await,
            Some(current) => self.update(desired, &current, owner, policy).await,
        }
    }

    /// Delete a child, treating absence as success.
    ///
    /// Skips the call entirely when the object or its owner is already
    /// terminating: cascading garbage collection handles the rest.
    pub async fn delete<T, O>(&self, name: &str, namespace: &str, owner: Option<&O>) -> Result<()>
    where
        T: ChildResource,
        O: Resource<DynamicType = ()> + Send + Sync,
    {
        let kind = T::kind(&());
        let current = match self.get::<T>(name, namespace).await? {
            Some(current) => current,
            None => return Ok(()),
        };

        self.check_ownership(&current, owner, kind.as_ref(), namespace, name)?;

        if current.meta().deletion_timestamp.is_some() {
            debug!(kind = %kind, namespace = %namespace, name = %name, "child already terminating");
            return Ok(());
        }
        if let Some(owner) = owner {
            if owner.meta().deletion_timestamp.is_some() {
                debug!(
                    kind = %kind,
                    namespace = %namespace,
                    name = %name,
                    "owner terminating, leaving deletion to garbage collection"
                );
                return Ok(());
            }
        }

        let api = self.api_for::<T>(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(kind = %kind, namespace = %namespace, name = %name, "deleted child resource");
                self.publish(
                    owner,
                    EventType::Normal,
                    reasons::DELETED,
                    actions::DELETE,
                    format!("Deleted {} {}/{}", kind, namespace, name),
                )
                .await;
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::delete_failed(kind.as_ref(), namespace, name, e)),
        }
    }

    fn check_ownership<T, O>(
        &self,
        current: &T,
        owner: Option<&O>,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>
    where
        T: ChildResource,
        O: Resource<DynamicType = ()>,
    {
        if let Some(owner) = owner {
            if !is_controlled_by(current.meta(), owner) {
                return Err(Error::not_controlled_by(
                    kind,
                    namespace,
                    name,
                    owner.name_any(),
                ));
            }
        }
        Ok(())
    }

    async fn publish<O>(
        &self,
        owner: Option<&O>,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) where
        O: Resource<DynamicType = ()>,
    {
        if let Some(owner) = owner {
            self.events
                .publish(&owner.object_ref(&()), type_, reason, action, Some(note))
                .await;
        }
    }
}

fn object_keys<T: ChildResource>(resource: &T) -> Result<(String, String)> {
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("engine", "child resource has no name"))?;
    let namespace = resource
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::internal_with_context("engine", "child resource has no namespace"))?;
    Ok((name, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn create_only_policy_treats_everything_as_equal() {
        let policy: ChildPolicy<ConfigMap> = ChildPolicy::create_only();
        let a = ConfigMap::default();
        let mut b = ConfigMap::default();
        b.metadata.name = Some("other".to_string());
        assert!((policy.equals)(&a, &b));
    }

    #[test]
    fn object_keys_require_name_and_namespace() {
        let nameless = ConfigMap::default();
        assert!(object_keys(&nameless).is_err());

        let namespaced = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cfg".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let (name, namespace) = object_keys(&namespaced).expect("keys");
        assert_eq!(name, "cfg");
        assert_eq!(namespace, "ns");
    }
}

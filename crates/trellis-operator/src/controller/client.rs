//! Cluster access seam for the inference reconciler
//!
//! Every API interaction the reconciler performs goes through [`ChildClient`]
//! so the orchestration logic stays testable without an API server. The
//! production implementation drives the shared [`ResourceEngine`], which owns
//! dry-run projection, semantic comparison, and ownership checks; this module
//! only decides what "converged" means per child kind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;

use trellis_common::crd::networking::{
    HTTPRoute, InferencePool, InferencePoolLegacy, LeaderWorkerSet,
};
use trellis_common::crd::{
    TrellisInferenceConfig, TrellisInferenceService, TrellisInferenceServiceStatus,
};
use trellis_common::kube_utils::{patch_annotation, patch_resource_status};
use trellis_common::retry::{retry_with_backoff, RetryConfig};
use trellis_common::{
    Error, Result, FIELD_MANAGER, POOL_MIGRATION_ANNOTATION, POOL_MIGRATION_V1,
};

use crate::engine::{ChildPolicy, ResourceEngine};

/// Operations the reconciler needs from the cluster.
///
/// One method pair per managed child kind: `reconcile_*` converges the child
/// toward the desired object and returns it as stored (status included),
/// `delete_*` removes it treating absence as success. Reads used for
/// composition and configuration take explicit namespaces because they may
/// fall back to the system namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChildClient: Send + Sync {
    /// Fetch a ServiceAccount, for credential discovery. Absence is not an
    /// error; pods can run under accounts that do not exist yet.
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Fetch a Secret, for credential discovery.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Converge a workload or scheduler ServiceAccount.
    async fn reconcile_service_account(
        &self,
        instance: &TrellisInferenceService,
        desired: ServiceAccount,
    ) -> Result<ServiceAccount>;

    /// Delete a managed ServiceAccount.
    async fn delete_service_account(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()>;

    /// Converge a Deployment and return it with live status.
    async fn reconcile_deployment(
        &self,
        instance: &TrellisInferenceService,
        desired: Deployment,
    ) -> Result<Deployment>;

    /// Delete a managed Deployment.
    async fn delete_deployment(&self, instance: &TrellisInferenceService, name: &str)
        -> Result<()>;

    /// Converge a LeaderWorkerSet and return it with live status.
    async fn reconcile_leader_worker_set(
        &self,
        instance: &TrellisInferenceService,
        desired: LeaderWorkerSet,
    ) -> Result<LeaderWorkerSet>;

    /// Delete a managed LeaderWorkerSet.
    async fn delete_leader_worker_set(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()>;

    /// Converge a Service.
    async fn reconcile_service(
        &self,
        instance: &TrellisInferenceService,
        desired: Service,
    ) -> Result<Service>;

    /// Delete a managed Service.
    async fn delete_service(&self, instance: &TrellisInferenceService, name: &str) -> Result<()>;

    /// Create the TLS secret if absent. An existing secret is left exactly
    /// as stored so the certificate is never rotated by reconciliation.
    async fn ensure_tls_secret(
        &self,
        instance: &TrellisInferenceService,
        desired: Secret,
    ) -> Result<Secret>;

    /// Delete a managed Secret.
    async fn delete_secret(&self, instance: &TrellisInferenceService, name: &str) -> Result<()>;

    /// Converge an HTTPRoute.
    async fn reconcile_http_route(
        &self,
        instance: &TrellisInferenceService,
        desired: HTTPRoute,
    ) -> Result<HTTPRoute>;

    /// Delete a managed HTTPRoute.
    async fn delete_http_route(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()>;

    /// Converge a Role.
    async fn reconcile_role(
        &self,
        instance: &TrellisInferenceService,
        desired: Role,
    ) -> Result<Role>;

    /// Delete a managed Role.
    async fn delete_role(&self, instance: &TrellisInferenceService, name: &str) -> Result<()>;

    /// Converge a RoleBinding.
    async fn reconcile_role_binding(
        &self,
        instance: &TrellisInferenceService,
        desired: RoleBinding,
    ) -> Result<RoleBinding>;

    /// Delete a managed RoleBinding.
    async fn delete_role_binding(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()>;

    /// Converge a legacy-generation inference pool.
    async fn reconcile_legacy_pool(
        &self,
        instance: &TrellisInferenceService,
        desired: InferencePoolLegacy,
    ) -> Result<InferencePoolLegacy>;

    /// Delete the legacy-generation inference pool.
    async fn delete_legacy_pool(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()>;

    /// Converge a current-generation inference pool and return it with live
    /// status, which carries the acceptance signal the migration waits on.
    async fn reconcile_pool(
        &self,
        instance: &TrellisInferenceService,
        desired: InferencePool,
    ) -> Result<InferencePool>;

    /// Delete the current-generation inference pool.
    async fn delete_pool(&self, instance: &TrellisInferenceService, name: &str) -> Result<()>;

    /// Converge a ConfigMap that is shared between instances and therefore
    /// carries no owner reference (the per-namespace CA bundle copy).
    async fn reconcile_shared_config_map(&self, desired: ConfigMap) -> Result<ConfigMap>;

    /// Fetch a ConfigMap by name, falling back to a second namespace.
    async fn find_config_map(
        &self,
        namespace: &str,
        fallback_namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>>;

    /// Fetch a configuration fragment by name, falling back to a second
    /// namespace.
    async fn get_base_config(
        &self,
        namespace: &str,
        fallback_namespace: &str,
        name: &str,
    ) -> Result<Option<TrellisInferenceConfig>>;

    /// Replace the instance's status subresource.
    async fn patch_status(
        &self,
        instance: &TrellisInferenceService,
        status: TrellisInferenceServiceStatus,
    ) -> Result<()>;

    /// Persist the pool migration annotation on the instance. The
    /// annotation is the one-way latch: once set, routes bind the
    /// current-generation pool and never fall back.
    async fn commit_pool_migration(&self, instance: &TrellisInferenceService) -> Result<()>;
}

// ===== Per-kind convergence =====

fn subset(wanted: Option<&BTreeMap<String, String>>, live: Option<&BTreeMap<String, String>>) -> bool {
    let Some(wanted) = wanted else {
        return true;
    };
    wanted
        .iter()
        .all(|(key, value)| live.is_some_and(|m| m.get(key) == Some(value)))
}

/// Managed labels and annotations present on the live object.
///
/// Subset rather than equality: other controllers annotate children we own
/// (revision trackers, autoscalers), and fighting them would produce write
/// loops.
fn metadata_converged<T: Resource>(projected: &T, live: &T) -> bool {
    subset(projected.meta().labels.as_ref(), live.meta().labels.as_ref())
        && subset(
            projected.meta().annotations.as_ref(),
            live.meta().annotations.as_ref(),
        )
}

fn deployment_converged(projected: &Deployment, live: &Deployment) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

fn service_converged(projected: &Service, live: &Service) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

fn service_account_converged(projected: &ServiceAccount, live: &ServiceAccount) -> bool {
    metadata_converged(projected, live)
}

fn role_converged(projected: &Role, live: &Role) -> bool {
    projected.rules == live.rules && metadata_converged(projected, live)
}

fn role_binding_converged(projected: &RoleBinding, live: &RoleBinding) -> bool {
    projected.subjects == live.subjects
        && projected.role_ref == live.role_ref
        && metadata_converged(projected, live)
}

fn config_map_converged(projected: &ConfigMap, live: &ConfigMap) -> bool {
    projected.data == live.data && metadata_converged(projected, live)
}

fn route_converged(projected: &HTTPRoute, live: &HTTPRoute) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

fn lws_converged(projected: &LeaderWorkerSet, live: &LeaderWorkerSet) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

fn legacy_pool_converged(projected: &InferencePoolLegacy, live: &InferencePoolLegacy) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

fn pool_converged(projected: &InferencePool, live: &InferencePool) -> bool {
    projected.spec == live.spec && metadata_converged(projected, live)
}

// ===== Production implementation =====

/// [`ChildClient`] backed by the shared [`ResourceEngine`].
pub struct EngineChildClient {
    engine: ResourceEngine,
}

impl EngineChildClient {
    /// Wrap an engine.
    pub fn new(engine: ResourceEngine) -> Self {
        Self { engine }
    }

    fn namespace_of(instance: &TrellisInferenceService) -> Result<String> {
        instance
            .namespace()
            .ok_or_else(|| Error::internal_with_context("controller", "instance has no namespace"))
    }
}

#[async_trait]
impl ChildClient for EngineChildClient {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        self.engine.get(name, namespace).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.engine.get(name, namespace).await
    }

    async fn reconcile_service_account(
        &self,
        instance: &TrellisInferenceService,
        desired: ServiceAccount,
    ) -> Result<ServiceAccount> {
        self.engine
            .reconcile(
                desired,
                Some(instance),
                &ChildPolicy::new(service_account_converged),
            )
            .await
    }

    async fn delete_service_account(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<ServiceAccount, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_deployment(
        &self,
        instance: &TrellisInferenceService,
        desired: Deployment,
    ) -> Result<Deployment> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(deployment_converged))
            .await
    }

    async fn delete_deployment(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<Deployment, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_leader_worker_set(
        &self,
        instance: &TrellisInferenceService,
        desired: LeaderWorkerSet,
    ) -> Result<LeaderWorkerSet> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(lws_converged))
            .await
    }

    async fn delete_leader_worker_set(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<LeaderWorkerSet, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_service(
        &self,
        instance: &TrellisInferenceService,
        desired: Service,
    ) -> Result<Service> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(service_converged))
            .await
    }

    async fn delete_service(&self, instance: &TrellisInferenceService, name: &str) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<Service, _>(name, &namespace, Some(instance))
            .await
    }

    async fn ensure_tls_secret(
        &self,
        instance: &TrellisInferenceService,
        desired: Secret,
    ) -> Result<Secret> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::create_only())
            .await
    }

    async fn delete_secret(&self, instance: &TrellisInferenceService, name: &str) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<Secret, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_http_route(
        &self,
        instance: &TrellisInferenceService,
        desired: HTTPRoute,
    ) -> Result<HTTPRoute> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(route_converged))
            .await
    }

    async fn delete_http_route(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<HTTPRoute, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_role(
        &self,
        instance: &TrellisInferenceService,
        desired: Role,
    ) -> Result<Role> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(role_converged))
            .await
    }

    async fn delete_role(&self, instance: &TrellisInferenceService, name: &str) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<Role, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_role_binding(
        &self,
        instance: &TrellisInferenceService,
        desired: RoleBinding,
    ) -> Result<RoleBinding> {
        self.engine
            .reconcile(
                desired,
                Some(instance),
                &ChildPolicy::new(role_binding_converged),
            )
            .await
    }

    async fn delete_role_binding(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<RoleBinding, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_legacy_pool(
        &self,
        instance: &TrellisInferenceService,
        desired: InferencePoolLegacy,
    ) -> Result<InferencePoolLegacy> {
        self.engine
            .reconcile(
                desired,
                Some(instance),
                &ChildPolicy::new(legacy_pool_converged),
            )
            .await
    }

    async fn delete_legacy_pool(
        &self,
        instance: &TrellisInferenceService,
        name: &str,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<InferencePoolLegacy, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_pool(
        &self,
        instance: &TrellisInferenceService,
        desired: InferencePool,
    ) -> Result<InferencePool> {
        self.engine
            .reconcile(desired, Some(instance), &ChildPolicy::new(pool_converged))
            .await
    }

    async fn delete_pool(&self, instance: &TrellisInferenceService, name: &str) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        self.engine
            .delete::<InferencePool, _>(name, &namespace, Some(instance))
            .await
    }

    async fn reconcile_shared_config_map(&self, desired: ConfigMap) -> Result<ConfigMap> {
        self.engine
            .reconcile(
                desired,
                Option::<&TrellisInferenceService>::None,
                &ChildPolicy::new(config_map_converged),
            )
            .await
    }

    async fn find_config_map(
        &self,
        namespace: &str,
        fallback_namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>> {
        self.engine
            .get_with_fallback(name, namespace, fallback_namespace)
            .await
    }

    async fn get_base_config(
        &self,
        namespace: &str,
        fallback_namespace: &str,
        name: &str,
    ) -> Result<Option<TrellisInferenceConfig>> {
        self.engine
            .get_with_fallback(name, namespace, fallback_namespace)
            .await
    }

    async fn patch_status(
        &self,
        instance: &TrellisInferenceService,
        status: TrellisInferenceServiceStatus,
    ) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        let name = instance.name_any();
        // Status races with concurrent updaters at the end of every pass
        retry_with_backoff(&RetryConfig::with_max_attempts(3), "patch_status", || {
            patch_resource_status::<TrellisInferenceService>(
                self.engine.client(),
                &name,
                &namespace,
                &status,
                FIELD_MANAGER,
            )
        })
        .await
        .map_err(|e| Error::update_failed("TrellisInferenceService", &namespace, &name, e))
    }

    async fn commit_pool_migration(&self, instance: &TrellisInferenceService) -> Result<()> {
        let namespace = Self::namespace_of(instance)?;
        let name = instance.name_any();
        patch_annotation::<TrellisInferenceService>(
            self.engine.client(),
            &name,
            &namespace,
            POOL_MIGRATION_ANNOTATION,
            POOL_MIGRATION_V1,
            FIELD_MANAGER,
        )
        .await
        .map_err(|e| Error::update_failed("TrellisInferenceService", &namespace, &name, e))
    }
}

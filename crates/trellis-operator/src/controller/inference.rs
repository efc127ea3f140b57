//! TrellisInferenceService reconciliation
//!
//! One pass walks the instance through its stages in dependency order:
//! resolve the effective spec from base configs, settle workload identity,
//! attach model storage and converge the serving workloads per role, then
//! the router surface, then the request scheduler and its inference pools,
//! and finally lift child readiness into status conditions.
//!
//! The stop annotation short-circuits everything: children that hold
//! compute or traffic are deleted and the instance waits for the
//! annotation to change. Identity and RBAC children survive a stop so
//! resuming is a pure re-create of the serving path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, PodSpec};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use trellis_common::crd::{
    merge_specs, PoolMigration, TrellisInferenceService, TrellisInferenceServiceSpec,
    TrellisInferenceServiceStatus, CONDITION_MAIN_WORKLOAD_READY, CONDITION_PREFILL_WORKLOAD_READY,
    CONDITION_READY, CONDITION_ROUTER_READY, CONDITION_SCHEDULER_READY,
};
use trellis_common::events::{actions, reasons, EventPublisher};
use trellis_common::kube_utils::{find_condition, new_condition, set_condition, STATUS_TRUE};
use trellis_common::{
    Error, Result, LABEL_COMPONENT, LABEL_PART_OF, PART_OF_VALUE, STOP_ANNOTATION,
};

use crate::config::OperatorConfig;
use crate::controller::client::ChildClient;
use crate::identity::{self, IdentityPlan, WorkloadRole};
use crate::router;
use crate::scheduler::{self, ConfigSource};
use crate::storage::credentials::CredentialContext;
use crate::storage::{ModelStorage, GLOBAL_CA_BUNDLE_CONFIG_MAP};
use crate::workload::{
    self, deployment_readiness, lws_readiness, multi_node, single_node, WorkloadReadiness,
};

/// Steady-state resync interval once children converged
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Backoff for retryable reconcile failures
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(30);

const REASON_RECONCILED: &str = "Reconciled";
const REASON_STOPPED: &str = "Stopped";
const REASON_ALL_READY: &str = "AllComponentsReady";
const REASON_NOT_READY: &str = "ComponentsNotReady";
const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
const REASON_INVALID_CONFIGURATION: &str = "InvalidConfiguration";

// ===== Context =====

/// Shared state for all reconcile calls.
pub struct InferenceContext {
    /// Cluster access seam
    pub client: Arc<dyn ChildClient>,
    /// Operator-level configuration
    pub config: OperatorConfig,
    /// Event sink for instance lifecycle events; child CRUD events are
    /// published by the engine behind [`ChildClient`]
    pub events: Arc<dyn EventPublisher>,
}

impl InferenceContext {
    /// Create a context over a client implementation.
    pub fn new(
        client: Arc<dyn ChildClient>,
        config: OperatorConfig,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            config,
            events,
        }
    }

    #[cfg(test)]
    fn for_testing(client: Arc<dyn ChildClient>) -> Self {
        Self {
            client,
            config: OperatorConfig::default(),
            events: Arc::new(trellis_common::events::NoopEventPublisher),
        }
    }
}

// ===== Entry points =====

/// Reconcile one TrellisInferenceService.
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any(), namespace = %instance.namespace().unwrap_or_default()))]
pub async fn reconcile(
    instance: Arc<TrellisInferenceService>,
    ctx: Arc<InferenceContext>,
) -> Result<Action> {
    match reconcile_inner(&ctx, &instance).await {
        Ok(action) => Ok(action),
        Err(error) => {
            record_failure(&ctx, &instance, &error).await;
            Err(error)
        }
    }
}

/// Requeue strategy on failure: transient errors back off, everything
/// else waits for a spec change.
pub fn error_policy(
    instance: Arc<TrellisInferenceService>,
    error: &Error,
    _ctx: Arc<InferenceContext>,
) -> Action {
    warn!(
        instance = %instance.name_any(),
        %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ERROR_RETRY_INTERVAL)
    } else {
        Action::await_change()
    }
}

async fn reconcile_inner(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
) -> Result<Action> {
    let was_stopped = previously_stopped(instance);

    if instance.is_stopped() {
        info!("stop annotation present, tearing down serving children");
        teardown(ctx, instance).await?;
        ctx.client
            .patch_status(instance, stopped_status(instance))
            .await?;
        if !was_stopped {
            publish(
                ctx,
                instance,
                EventType::Normal,
                reasons::STOPPED,
                format!("serving stopped by the {STOP_ANNOTATION} annotation"),
            )
            .await;
        }
        return Ok(Action::await_change());
    }

    let effective = effective_instance(ctx, instance).await?;

    let main = reconcile_workload(ctx, &effective, WorkloadRole::Main)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context("controller", "main workload produced no readiness")
        })?;
    let prefill = reconcile_workload(ctx, &effective, WorkloadRole::Prefill).await?;
    reconcile_router(ctx, &effective).await?;
    let scheduler = reconcile_scheduler(ctx, &effective).await?;

    let status = build_status(&effective, &main, prefill.as_ref(), scheduler.as_ref());
    ctx.client.patch_status(&effective, status).await?;

    if was_stopped {
        publish(
            ctx,
            instance,
            EventType::Normal,
            reasons::RESUMED,
            "stop annotation removed, serving children recreated".to_string(),
        )
        .await;
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

// ===== Effective spec =====

/// Fold base configuration fragments under the instance spec.
///
/// Later refs override earlier ones and the instance spec overrides them
/// all. Refs resolve in the instance namespace first, then the system
/// namespace.
async fn effective_instance(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
) -> Result<TrellisInferenceService> {
    if instance.spec.base_refs.is_empty() {
        return Ok(instance.clone());
    }

    let namespace = namespace_of(instance);
    let mut merged = TrellisInferenceServiceSpec::default();
    for base_ref in &instance.spec.base_refs {
        let config = ctx
            .client
            .get_base_config(&namespace, &ctx.config.system_namespace, &base_ref.name)
            .await?
            .ok_or_else(|| {
                Error::configuration_for_field(
                    instance.name_any(),
                    "spec.baseRefs",
                    format!(
                        "base config {:?} not found in {:?} or {:?}",
                        base_ref.name, namespace, ctx.config.system_namespace
                    ),
                )
            })?;
        merged = merge_specs(merged, &config.spec.fragment)?;
    }

    let mut effective = instance.clone();
    effective.spec = merge_specs(merged, &instance.spec)?;
    Ok(effective)
}

// ===== Workloads =====

/// Pod specs of one role, prepared for the child builder.
enum PreparedWorkload {
    SingleNode(PodSpec),
    MultiNode {
        leader: Option<PodSpec>,
        worker: PodSpec,
    },
}

fn pod_specs(prepared: &mut PreparedWorkload) -> Vec<&mut PodSpec> {
    match prepared {
        PreparedWorkload::SingleNode(pod) => vec![pod],
        PreparedWorkload::MultiNode { leader, worker } => {
            let mut pods: Vec<&mut PodSpec> = Vec::new();
            if let Some(leader) = leader.as_mut() {
                pods.push(leader);
            }
            pods.push(worker);
            pods
        }
    }
}

fn template_field(role: WorkloadRole) -> &'static str {
    match role {
        WorkloadRole::Main => "spec.workload.template",
        WorkloadRole::Prefill => "spec.prefill.template",
    }
}

/// Converge one role: identity, model storage, and the serving child.
///
/// Returns the role's readiness, or `None` when the role is not
/// configured (inactive prefill), in which case both possible children
/// are removed.
async fn reconcile_workload(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
    role: WorkloadRole,
) -> Result<Option<WorkloadReadiness>> {
    let plan = identity::plan(instance, role);
    match &plan {
        IdentityPlan::Managed(account) => {
            ctx.client
                .reconcile_service_account(instance, (**account).clone())
                .await?;
        }
        IdentityPlan::Retire(name) => {
            ctx.client.delete_service_account(instance, name).await?;
        }
        IdentityPlan::Explicit(_) => {}
    }

    let Some(spec) = role.workload_spec(instance) else {
        ctx.client
            .delete_deployment(instance, &workload::deployment_name(instance, role))
            .await?;
        ctx.client
            .delete_leader_worker_set(instance, &workload::lws_name(instance, role))
            .await?;
        return Ok(None);
    };

    let mut prepared = match spec.worker.clone() {
        Some(worker) => PreparedWorkload::MultiNode {
            leader: spec.template.clone(),
            worker,
        },
        None => {
            let template = spec.template.clone().ok_or_else(|| {
                Error::configuration_for_field(
                    instance.name_any(),
                    template_field(role),
                    "single-node serving requires a pod template",
                )
            })?;
            PreparedWorkload::SingleNode(template)
        }
    };

    identity::apply(&plan, &mut pod_specs(&mut prepared));
    let credentials = credential_context(ctx, instance, &prepared).await?;
    let attachment = ModelStorage::new(&ctx.config).attach_all(
        instance,
        &mut pod_specs(&mut prepared),
        &credentials,
    )?;
    if attachment.requires_global_ca_bundle() {
        materialize_global_ca_bundle(ctx, instance).await?;
    }

    let readiness = match prepared {
        PreparedWorkload::SingleNode(pod_spec) => {
            let desired = single_node::deployment(instance, role, pod_spec);
            let live = ctx.client.reconcile_deployment(instance, desired).await?;
            // A role that dropped back from multi-node leaves a set behind
            ctx.client
                .delete_leader_worker_set(instance, &workload::lws_name(instance, role))
                .await?;
            deployment_readiness(Some(&live))
        }
        PreparedWorkload::MultiNode { leader, worker } => {
            let desired = multi_node::leader_worker_set(instance, role, leader, worker);
            let live = ctx
                .client
                .reconcile_leader_worker_set(instance, desired)
                .await?;
            ctx.client
                .delete_deployment(instance, &workload::deployment_name(instance, role))
                .await?;
            lws_readiness(Some(&live))
        }
    };
    Ok(Some(readiness))
}

/// Resolve the credential snapshot the storage attacher reads.
///
/// Uses the account the role's first serving pod will run under, after
/// identity settled, falling back to the namespace default account.
async fn credential_context(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
    prepared: &PreparedWorkload,
) -> Result<CredentialContext> {
    let primary = match prepared {
        PreparedWorkload::SingleNode(pod) => pod,
        PreparedWorkload::MultiNode { leader, worker } => leader.as_ref().unwrap_or(worker),
    };
    let account_name = primary
        .service_account_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string());

    let namespace = namespace_of(instance);
    let service_account = ctx
        .client
        .get_service_account(&namespace, &account_name)
        .await?;

    let mut secrets = Vec::new();
    for reference in service_account
        .iter()
        .flat_map(|account| account.secrets.iter().flatten())
    {
        let Some(name) = reference.name.as_deref() else {
            continue;
        };
        if let Some(secret) = ctx.client.get_secret(&namespace, name).await? {
            secrets.push(secret);
        } else {
            debug!(secret = %name, "service account lists a missing secret");
        }
    }

    Ok(CredentialContext {
        service_account,
        secrets,
    })
}

/// Copy the system CA bundle into the instance namespace.
///
/// The copy is shared by every instance in the namespace, so it carries
/// managed labels but no owner reference.
async fn materialize_global_ca_bundle(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
) -> Result<()> {
    let Some(source_name) = ctx.config.ca_bundle_config_map.as_deref() else {
        return Err(Error::configuration_for(
            instance.name_any(),
            "pods reference the global CA bundle but the operator has none configured",
        ));
    };
    let system_namespace = ctx.config.system_namespace.as_str();
    let source = ctx
        .client
        .find_config_map(system_namespace, system_namespace, source_name)
        .await?
        .ok_or_else(|| {
            Error::configuration_for(
                instance.name_any(),
                format!("CA bundle config map {source_name:?} not found in {system_namespace:?}"),
            )
        })?;

    let copy = ConfigMap {
        metadata: ObjectMeta {
            name: Some(GLOBAL_CA_BUNDLE_CONFIG_MAP.to_string()),
            namespace: Some(namespace_of(instance)),
            labels: Some(BTreeMap::from([
                (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
                (LABEL_COMPONENT.to_string(), "storage".to_string()),
            ])),
            ..Default::default()
        },
        data: source.data.clone(),
        binary_data: source.binary_data.clone(),
        ..Default::default()
    };
    ctx.client.reconcile_shared_config_map(copy).await?;
    Ok(())
}

// ===== Router =====

async fn reconcile_router(ctx: &InferenceContext, instance: &TrellisInferenceService) -> Result<()> {
    ctx.client
        .reconcile_service(instance, router::workload_service(instance))
        .await?;

    // Key generation only runs when the secret is absent; an existing
    // certificate is never rotated.
    let namespace = namespace_of(instance);
    let secret_name = router::tls_secret_name(instance);
    if ctx
        .client
        .get_secret(&namespace, &secret_name)
        .await?
        .is_none()
    {
        ctx.client
            .ensure_tls_secret(instance, router::tls_secret(instance)?)
            .await?;
    }

    if router::managed_route_enabled(instance) {
        ctx.client
            .reconcile_http_route(instance, router::http_route(instance))
            .await?;
    } else {
        ctx.client
            .delete_http_route(instance, &router::route_name(instance))
            .await?;
    }
    Ok(())
}

// ===== Scheduler =====

async fn reconcile_scheduler(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
) -> Result<Option<WorkloadReadiness>> {
    if !scheduler::scheduler_enabled(instance) {
        remove_scheduler(ctx, instance).await?;
        return Ok(None);
    }

    ctx.client
        .reconcile_service_account(instance, scheduler::service_account(instance))
        .await?;
    ctx.client
        .reconcile_role(instance, scheduler::role(instance))
        .await?;
    ctx.client
        .reconcile_role_binding(instance, scheduler::role_binding(instance))
        .await?;

    let config_text = resolve_scheduler_config(ctx, instance).await?;
    let live = ctx
        .client
        .reconcile_deployment(
            instance,
            scheduler::deployment(instance, &ctx.config, &config_text),
        )
        .await?;
    ctx.client
        .reconcile_service(instance, scheduler::service(instance, &ctx.config))
        .await?;

    reconcile_pools(ctx, instance).await?;
    Ok(Some(deployment_readiness(Some(&live))))
}

async fn resolve_scheduler_config(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
) -> Result<String> {
    match scheduler::config_source(instance) {
        ConfigSource::Inline(value) => scheduler::render_inline_config(value),
        ConfigSource::ConfigMap(reference) => {
            let namespace = namespace_of(instance);
            let map = ctx
                .client
                .find_config_map(&namespace, &ctx.config.system_namespace, &reference.name)
                .await?
                .ok_or_else(|| {
                    Error::configuration_for_field(
                        instance.name_any(),
                        "spec.router.scheduler.config.configMap",
                        format!(
                            "config map {:?} not found in {:?} or {:?}",
                            reference.name, namespace, ctx.config.system_namespace
                        ),
                    )
                })?;
            scheduler::config_text_from_map(instance, reference, &map)
        }
        ConfigSource::Default => Ok(scheduler::default_config_text(instance)),
    }
}

/// Remove every scheduler child after the scheduler was dropped from the
/// spec. Unlike a stop, this also removes identity and RBAC: nothing is
/// coming back.
async fn remove_scheduler(ctx: &InferenceContext, instance: &TrellisInferenceService) -> Result<()> {
    ctx.client
        .delete_deployment(instance, &scheduler::deployment_name(instance))
        .await?;
    ctx.client
        .delete_service(instance, &scheduler::service_name(instance))
        .await?;
    ctx.client
        .delete_pool(instance, &scheduler::pool_name(instance))
        .await?;
    ctx.client
        .delete_legacy_pool(instance, &scheduler::pool_name(instance))
        .await?;
    ctx.client
        .delete_role_binding(instance, &scheduler::role_binding_name(instance))
        .await?;
    ctx.client
        .delete_role(instance, &scheduler::role_name(instance))
        .await?;
    ctx.client
        .delete_service_account(instance, &scheduler::service_account_name(instance))
        .await?;
    Ok(())
}

// ===== Pool migration =====

/// Run both pool generations until the current one is accepted, then
/// latch the migration and retire the legacy pool.
///
/// The latch is the migration annotation on the instance; committing it
/// triggers a watch event, and the next pass binds routes to the
/// current-generation pool and deletes the legacy one.
async fn reconcile_pools(ctx: &InferenceContext, instance: &TrellisInferenceService) -> Result<()> {
    let pool = ctx
        .client
        .reconcile_pool(instance, scheduler::pool(instance))
        .await?;

    match instance.pool_migration() {
        PoolMigration::Migrated => {
            ctx.client
                .delete_legacy_pool(instance, &scheduler::pool_name(instance))
                .await?;
        }
        PoolMigration::NotMigrated => {
            ctx.client
                .reconcile_legacy_pool(instance, scheduler::legacy_pool(instance))
                .await?;
            if pool.is_accepted() {
                info!("current-generation inference pool accepted, committing migration");
                ctx.client.commit_pool_migration(instance).await?;
                publish(
                    ctx,
                    instance,
                    EventType::Normal,
                    reasons::POOL_MIGRATED,
                    "routes now bind the current-generation inference pool".to_string(),
                )
                .await;
            }
        }
    }
    Ok(())
}

// ===== Stop =====

/// Delete everything holding compute or traffic. Service accounts, the
/// scheduler Role and RoleBinding, and the CA bundle copy stay.
async fn teardown(ctx: &InferenceContext, instance: &TrellisInferenceService) -> Result<()> {
    for role in WorkloadRole::ALL {
        ctx.client
            .delete_deployment(instance, &workload::deployment_name(instance, role))
            .await?;
        ctx.client
            .delete_leader_worker_set(instance, &workload::lws_name(instance, role))
            .await?;
    }
    ctx.client
        .delete_service(instance, &router::service_name(instance))
        .await?;
    ctx.client
        .delete_secret(instance, &router::tls_secret_name(instance))
        .await?;
    ctx.client
        .delete_http_route(instance, &router::route_name(instance))
        .await?;
    ctx.client
        .delete_deployment(instance, &scheduler::deployment_name(instance))
        .await?;
    ctx.client
        .delete_service(instance, &scheduler::service_name(instance))
        .await?;
    ctx.client
        .delete_pool(instance, &scheduler::pool_name(instance))
        .await?;
    ctx.client
        .delete_legacy_pool(instance, &scheduler::pool_name(instance))
        .await?;
    Ok(())
}

// ===== Status =====

fn previously_stopped(instance: &TrellisInferenceService) -> bool {
    instance
        .status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, CONDITION_READY))
        .is_some_and(|condition| condition.reason == REASON_STOPPED)
}

fn prior_conditions(
    instance: &TrellisInferenceService,
) -> Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition> {
    instance
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default()
}

fn build_status(
    instance: &TrellisInferenceService,
    main: &WorkloadReadiness,
    prefill: Option<&WorkloadReadiness>,
    scheduler: Option<&WorkloadReadiness>,
) -> TrellisInferenceServiceStatus {
    let generation = instance.metadata.generation;
    let mut conditions = prior_conditions(instance);

    set_condition(
        &mut conditions,
        new_condition(
            CONDITION_MAIN_WORKLOAD_READY,
            main.ready,
            &main.reason,
            &main.message,
            generation,
        ),
    );
    match prefill {
        Some(readiness) => set_condition(
            &mut conditions,
            new_condition(
                CONDITION_PREFILL_WORKLOAD_READY,
                readiness.ready,
                &readiness.reason,
                &readiness.message,
                generation,
            ),
        ),
        None => conditions.retain(|c| c.type_ != CONDITION_PREFILL_WORKLOAD_READY),
    }
    set_condition(
        &mut conditions,
        new_condition(CONDITION_ROUTER_READY, true, REASON_RECONCILED, "", generation),
    );
    match scheduler {
        Some(readiness) => set_condition(
            &mut conditions,
            new_condition(
                CONDITION_SCHEDULER_READY,
                readiness.ready,
                &readiness.reason,
                &readiness.message,
                generation,
            ),
        ),
        None => conditions.retain(|c| c.type_ != CONDITION_SCHEDULER_READY),
    }

    let waiting: Vec<String> = conditions
        .iter()
        .filter(|c| c.type_ != CONDITION_READY && c.status != STATUS_TRUE)
        .map(|c| c.type_.clone())
        .collect();
    let ready = if waiting.is_empty() {
        new_condition(CONDITION_READY, true, REASON_ALL_READY, "", generation)
    } else {
        new_condition(
            CONDITION_READY,
            false,
            REASON_NOT_READY,
            &format!("waiting on {}", waiting.join(", ")),
            generation,
        )
    };
    set_condition(&mut conditions, ready);

    TrellisInferenceServiceStatus {
        conditions,
        observed_generation: generation,
    }
}

fn stopped_status(instance: &TrellisInferenceService) -> TrellisInferenceServiceStatus {
    let generation = instance.metadata.generation;
    let message = format!("stopped by the {STOP_ANNOTATION} annotation");
    let mut conditions = prior_conditions(instance);

    // Every component condition ever reported flips to stopped
    let component_types: Vec<String> = conditions
        .iter()
        .map(|c| c.type_.clone())
        .filter(|t| t != CONDITION_READY)
        .collect();
    for type_ in component_types {
        set_condition(
            &mut conditions,
            new_condition(&type_, false, REASON_STOPPED, &message, generation),
        );
    }
    if find_condition(&conditions, CONDITION_MAIN_WORKLOAD_READY).is_none() {
        set_condition(
            &mut conditions,
            new_condition(
                CONDITION_MAIN_WORKLOAD_READY,
                false,
                REASON_STOPPED,
                &message,
                generation,
            ),
        );
    }
    set_condition(
        &mut conditions,
        new_condition(CONDITION_READY, false, REASON_STOPPED, &message, generation),
    );

    TrellisInferenceServiceStatus {
        conditions,
        observed_generation: generation,
    }
}

/// Surface a reconcile failure as an event and a Ready=False condition.
/// Best effort; the error itself still reaches the requeue policy.
async fn record_failure(ctx: &InferenceContext, instance: &TrellisInferenceService, error: &Error) {
    let (condition_reason, event_reason) = if matches!(error, Error::Configuration { .. }) {
        (REASON_INVALID_CONFIGURATION, reasons::VALIDATION_FAILED)
    } else {
        (REASON_RECONCILE_FAILED, reasons::RECONCILE_FAILED)
    };
    publish(
        ctx,
        instance,
        EventType::Warning,
        event_reason,
        error.to_string(),
    )
    .await;

    let generation = instance.metadata.generation;
    let mut conditions = prior_conditions(instance);
    set_condition(
        &mut conditions,
        new_condition(
            CONDITION_READY,
            false,
            condition_reason,
            &error.to_string(),
            generation,
        ),
    );
    let status = TrellisInferenceServiceStatus {
        conditions,
        observed_generation: generation,
    };
    if let Err(patch_error) = ctx.client.patch_status(instance, status).await {
        warn!(error = %patch_error, "failed to surface the failure on status");
    }
}

// ===== Helpers =====

fn namespace_of(instance: &TrellisInferenceService) -> String {
    instance.namespace().unwrap_or_default()
}

async fn publish(
    ctx: &InferenceContext,
    instance: &TrellisInferenceService,
    type_: EventType,
    reason: &str,
    note: String,
) {
    ctx.events
        .publish(
            &instance.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, ObjectReference, Secret, ServiceAccount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

    use trellis_common::crd::networking::{
        InferencePool, InferencePoolStatus, LeaderWorkerSetStatus, PoolParentStatus,
        POOL_CONDITION_ACCEPTED,
    };
    use trellis_common::crd::{
        BaseRef, GatewayRef, GatewaySpec, ModelSpec, RouterSpec, SchedulerSpec,
        TrellisInferenceConfig, TrellisInferenceConfigSpec, WorkloadSpec,
    };
    use trellis_common::events::NoopEventPublisher;
    use trellis_common::kube_utils::CONDITION_AVAILABLE;
    use trellis_common::MAIN_CONTAINER_NAME;

    use crate::controller::client::MockChildClient;

    // ===== Fixtures =====

    fn serving_template() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                image: Some("vllm/vllm-openai:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn instance() -> TrellisInferenceService {
        let mut instance = TrellisInferenceService::new(
            "llama",
            TrellisInferenceServiceSpec {
                model: ModelSpec {
                    uri: "hf://meta-llama/Llama-3-8B".to_string(),
                    ..Default::default()
                },
                workload: WorkloadSpec {
                    replicas: Some(1),
                    template: Some(serving_template()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("ml".to_string());
        instance.metadata.uid = Some("9f2b...".to_string());
        instance.metadata.generation = Some(3);
        instance
    }

    fn with_router_and_scheduler(mut instance: TrellisInferenceService) -> TrellisInferenceService {
        instance.spec.router = Some(RouterSpec {
            gateway: Some(GatewaySpec {
                refs: vec![GatewayRef {
                    name: "inference-gateway".to_string(),
                    namespace: None,
                }],
            }),
            scheduler: Some(SchedulerSpec::default()),
            ..Default::default()
        });
        instance
    }

    fn available_deployment(mut deployment: Deployment) -> Deployment {
        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: CONDITION_AVAILABLE.to_string(),
                status: STATUS_TRUE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        deployment
    }

    fn accepted_pool(mut pool: InferencePool) -> InferencePool {
        pool.status = Some(InferencePoolStatus {
            parents: vec![PoolParentStatus {
                conditions: vec![new_condition(
                    POOL_CONDITION_ACCEPTED,
                    true,
                    "Accepted",
                    "",
                    None,
                )],
            }],
        });
        pool
    }

    fn context(client: MockChildClient) -> Arc<InferenceContext> {
        Arc::new(InferenceContext::for_testing(Arc::new(client)))
    }

    type CapturedStatus = Arc<Mutex<Option<TrellisInferenceServiceStatus>>>;

    fn capture_status(client: &mut MockChildClient) -> CapturedStatus {
        let captured: CapturedStatus = Arc::default();
        let sink = Arc::clone(&captured);
        client.expect_patch_status().times(1).returning(move |_, status| {
            *sink.lock().unwrap() = Some(status);
            Ok(())
        });
        captured
    }

    fn condition<'a>(status: &'a TrellisInferenceServiceStatus, type_: &str) -> &'a Condition {
        find_condition(&status.conditions, type_)
            .unwrap_or_else(|| panic!("missing condition {type_}"))
    }

    // ===== Stories =====

    /// Story: a single-node instance with a gateway and scheduler converges
    /// end to end and reports Ready once every child is available.
    #[tokio::test]
    async fn story_single_node_with_scheduler_converges() {
        let tis = Arc::new(with_router_and_scheduler(instance()));
        let mut client = MockChildClient::new();

        // Identity: both roles single-node, managed accounts retired
        client
            .expect_delete_service_account()
            .times(2)
            .returning(|_, _| Ok(()));
        // Credential discovery finds nothing; TLS probe also returns absent
        client
            .expect_get_service_account()
            .times(1)
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        // Workload deployment and scheduler deployment both come up available
        client
            .expect_reconcile_deployment()
            .times(2)
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .times(2)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_deployment()
            .withf(|_, name| name == "llama-workload-prefill")
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .times(2)
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_http_route()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_service_account()
            .withf(|_, account| account.metadata.name.as_deref() == Some("llama-scheduler-sa"))
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role_binding()
            .times(1)
            .returning(|_, desired| Ok(desired));
        // Pool is not accepted yet, so no migration commit is expected
        client
            .expect_reconcile_pool()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_legacy_pool()
            .times(1)
            .returning(|_, desired| Ok(desired));
        let captured = capture_status(&mut client);

        let action = reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

        let status = captured.lock().unwrap().clone().expect("status patched");
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(condition(&status, CONDITION_MAIN_WORKLOAD_READY).status, STATUS_TRUE);
        assert_eq!(condition(&status, CONDITION_ROUTER_READY).status, STATUS_TRUE);
        assert_eq!(condition(&status, CONDITION_SCHEDULER_READY).status, STATUS_TRUE);
        assert_eq!(condition(&status, CONDITION_READY).status, STATUS_TRUE);
        assert_eq!(condition(&status, CONDITION_READY).reason, REASON_ALL_READY);
        assert!(find_condition(&status.conditions, CONDITION_PREFILL_WORKLOAD_READY).is_none());
    }

    /// Story: the stop annotation removes every serving child but leaves
    /// identity alone; the instance then waits for the annotation to change.
    #[tokio::test]
    async fn story_stop_tears_down_serving_children() {
        let mut tis = with_router_and_scheduler(instance());
        tis.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(STOP_ANNOTATION.to_string(), "true".to_string());
        tis.status = Some(TrellisInferenceServiceStatus {
            conditions: vec![
                new_condition(CONDITION_MAIN_WORKLOAD_READY, true, "Available", "", Some(2)),
                new_condition(CONDITION_READY, true, REASON_ALL_READY, "", Some(2)),
            ],
            observed_generation: Some(2),
        });

        let mut client = MockChildClient::new();
        // Workload children for both roles plus the scheduler deployment
        client
            .expect_delete_deployment()
            .times(3)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_leader_worker_set()
            .times(2)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_service()
            .times(2)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_secret()
            .withf(|_, name| name == "llama-workload-tls")
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_delete_http_route()
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_delete_pool().times(1).returning(|_, _| Ok(()));
        client
            .expect_delete_legacy_pool()
            .times(1)
            .returning(|_, _| Ok(()));
        // Service accounts are deliberately not stubbed: deleting one here
        // would panic the test
        let captured = capture_status(&mut client);

        let action = reconcile(Arc::new(tis), context(client))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());

        let status = captured.lock().unwrap().clone().expect("status patched");
        let main = condition(&status, CONDITION_MAIN_WORKLOAD_READY);
        assert_eq!(main.status, "False");
        assert_eq!(main.reason, REASON_STOPPED);
        assert_eq!(condition(&status, CONDITION_READY).reason, REASON_STOPPED);
    }

    /// Story: once the current-generation pool reports Accepted, the
    /// migration commits exactly once; afterwards the legacy pool is retired
    /// and never reconciled again.
    #[tokio::test]
    async fn story_pool_migration_commits_on_acceptance() {
        let tis = Arc::new(with_router_and_scheduler(instance()));
        let mut client = MockChildClient::new();

        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_reconcile_deployment()
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_http_route()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_service_account()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role_binding()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_pool()
            .returning(|_, desired| Ok(accepted_pool(desired)));
        client
            .expect_reconcile_legacy_pool()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client
            .expect_commit_pool_migration()
            .times(1)
            .returning(|_| Ok(()));
        client.expect_patch_status().returning(|_, _| Ok(()));

        reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");
    }

    /// Story: a migrated instance retires the legacy pool and never touches
    /// the migration latch again.
    #[tokio::test]
    async fn story_migrated_instance_retires_legacy_pool() {
        let mut tis = with_router_and_scheduler(instance());
        tis.mark_pool_migrated();
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_reconcile_deployment()
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_http_route()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_service_account()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_role_binding()
            .returning(|_, desired| Ok(desired));
        client
            .expect_reconcile_pool()
            .returning(|_, desired| Ok(accepted_pool(desired)));
        // reconcile_legacy_pool and commit_pool_migration are not stubbed;
        // calling either would panic
        client
            .expect_delete_legacy_pool()
            .withf(|_, name| name == "llama-pool")
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_patch_status().returning(|_, _| Ok(()));

        reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");
    }

    /// Story: base config fragments merge under the instance spec, refs
    /// first and the instance last.
    #[tokio::test]
    async fn story_base_configs_fold_under_the_instance() {
        let mut tis = instance();
        tis.spec.base_refs = vec![BaseRef {
            name: "std-llama".to_string(),
        }];
        tis.spec.workload.replicas = None;
        let tis = Arc::new(tis);

        let fragment = TrellisInferenceServiceSpec {
            workload: WorkloadSpec {
                replicas: Some(4),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut client = MockChildClient::new();
        client
            .expect_get_base_config()
            .withf(|namespace, fallback, name| {
                namespace == "ml" && fallback == "trellis-system" && name == "std-llama"
            })
            .times(1)
            .returning(move |_, _, _| {
                Ok(Some(TrellisInferenceConfig::new(
                    "std-llama",
                    TrellisInferenceConfigSpec {
                        fragment: fragment.clone(),
                    },
                )))
            });
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        // The fragment's replica count survives the merge
        client
            .expect_reconcile_deployment()
            .withf(|_, desired| {
                desired.metadata.name.as_deref() == Some("llama-workload")
                    && desired.spec.as_ref().and_then(|s| s.replicas) == Some(4)
            })
            .times(1)
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client.expect_delete_http_route().returning(|_, _| Ok(()));
        // No scheduler configured: its children are removed
        client.expect_delete_service().returning(|_, _| Ok(()));
        client.expect_delete_pool().returning(|_, _| Ok(()));
        client.expect_delete_legacy_pool().returning(|_, _| Ok(()));
        client.expect_delete_role_binding().returning(|_, _| Ok(()));
        client.expect_delete_role().returning(|_, _| Ok(()));
        client.expect_patch_status().returning(|_, _| Ok(()));

        reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");
    }

    /// Story: a missing base config is a configuration error; nothing is
    /// reconciled and the failure lands on the Ready condition.
    #[tokio::test]
    async fn story_missing_base_config_fails_validation() {
        let mut tis = instance();
        tis.spec.base_refs = vec![BaseRef {
            name: "missing".to_string(),
        }];
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_get_base_config()
            .returning(|_, _, _| Ok(None));
        let captured = capture_status(&mut client);

        let error = reconcile(Arc::clone(&tis), context(client))
            .await
            .expect_err("missing base config must fail");
        assert!(!error.is_retryable());

        let status = captured.lock().unwrap().clone().expect("status patched");
        let ready = condition(&status, CONDITION_READY);
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, REASON_INVALID_CONFIGURATION);
    }

    /// Story: single-node serving without a pod template cannot be built.
    #[tokio::test]
    async fn story_single_node_requires_a_template() {
        let mut tis = instance();
        tis.spec.workload.template = None;
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client.expect_patch_status().returning(|_, _| Ok(()));

        let error = reconcile(Arc::clone(&tis), context(client))
            .await
            .expect_err("missing template must fail");
        assert!(!error.is_retryable());
        match error {
            Error::Configuration {
                field: Some(field), ..
            } => assert_eq!(field, "spec.workload.template"),
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    /// Story: a worker template switches the role to a LeaderWorkerSet
    /// under a managed account, and the stale Deployment is removed.
    #[tokio::test]
    async fn story_multi_node_runs_under_managed_identity() {
        let mut tis = instance();
        tis.spec.workload.worker = Some(serving_template());
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_reconcile_service_account()
            .withf(|_, account| account.metadata.name.as_deref() == Some("llama-sa"))
            .times(1)
            .returning(|_, desired| Ok(desired));
        // Prefill stays single-node, so its managed account is retired
        client
            .expect_delete_service_account()
            .withf(|_, name| name == "llama-prefill-sa")
            .times(1)
            .returning(|_, _| Ok(()));
        // Credentials resolve through the managed account and its secret
        client
            .expect_get_service_account()
            .withf(|namespace, name| namespace == "ml" && name == "llama-sa")
            .times(1)
            .returning(|_, _| {
                Ok(Some(ServiceAccount {
                    secrets: Some(vec![ObjectReference {
                        name: Some("hf-creds".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }))
            });
        client
            .expect_get_secret()
            .withf(|namespace, name| namespace == "ml" && name == "hf-creds")
            .times(1)
            .returning(|_, _| Ok(Some(Secret::default())));
        client
            .expect_reconcile_leader_worker_set()
            .withf(|_, desired| desired.metadata.name.as_deref() == Some("llama-mn"))
            .times(1)
            .returning(|_, mut desired| {
                desired.status = Some(LeaderWorkerSetStatus {
                    conditions: vec![new_condition(CONDITION_AVAILABLE, true, "AllGroupsReady", "", None)],
                    ready_replicas: Some(1),
                });
                Ok(desired)
            });
        client
            .expect_delete_deployment()
            .returning(|_, _| Ok(()));
        client
            .expect_delete_leader_worker_set()
            .withf(|_, name| name == "llama-mn-prefill")
            .times(1)
            .returning(|_, _| Ok(()));
        // TLS probe; disjoint from the credential expectation above
        client
            .expect_get_secret()
            .withf(|_, name| name != "hf-creds")
            .returning(|_, _| Ok(None));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client.expect_delete_http_route().returning(|_, _| Ok(()));
        client.expect_delete_service().returning(|_, _| Ok(()));
        client.expect_delete_pool().returning(|_, _| Ok(()));
        client.expect_delete_legacy_pool().returning(|_, _| Ok(()));
        client.expect_delete_role_binding().returning(|_, _| Ok(()));
        client.expect_delete_role().returning(|_, _| Ok(()));
        let captured = capture_status(&mut client);

        reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");

        let status = captured.lock().unwrap().clone().expect("status patched");
        assert_eq!(condition(&status, CONDITION_MAIN_WORKLOAD_READY).status, STATUS_TRUE);
        // No scheduler: the condition is absent rather than false
        assert!(find_condition(&status.conditions, CONDITION_SCHEDULER_READY).is_none());
    }

    /// Story: removing the stop annotation reconciles normally again and
    /// the Ready condition leaves the Stopped reason.
    #[tokio::test]
    async fn story_resume_recreates_serving_children() {
        let mut tis = instance();
        tis.status = Some(TrellisInferenceServiceStatus {
            conditions: vec![new_condition(
                CONDITION_READY,
                false,
                REASON_STOPPED,
                "stopped",
                Some(2),
            )],
            observed_generation: Some(2),
        });
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_reconcile_deployment()
            .times(1)
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .times(1)
            .returning(|_, desired| Ok(desired));
        client.expect_delete_http_route().returning(|_, _| Ok(()));
        client.expect_delete_service().returning(|_, _| Ok(()));
        client.expect_delete_pool().returning(|_, _| Ok(()));
        client.expect_delete_legacy_pool().returning(|_, _| Ok(()));
        client.expect_delete_role_binding().returning(|_, _| Ok(()));
        client.expect_delete_role().returning(|_, _| Ok(()));
        let captured = capture_status(&mut client);

        let action = reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

        let status = captured.lock().unwrap().clone().expect("status patched");
        assert_ne!(condition(&status, CONDITION_READY).reason, REASON_STOPPED);
    }

    /// Story: an s3 model outside the system namespace pulls the CA bundle
    /// copy into the instance namespace, without an owner reference.
    #[tokio::test]
    async fn story_s3_materializes_the_ca_bundle_copy() {
        let mut tis = instance();
        tis.spec.model.uri = "s3://models/llama".to_string();
        let tis = Arc::new(tis);

        let mut client = MockChildClient::new();
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_find_config_map()
            .withf(|namespace, fallback, name| {
                namespace == "trellis-system" && fallback == "trellis-system" && name == "trellis-ca"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(Some(ConfigMap {
                    data: Some(BTreeMap::from([(
                        "cabundle.crt".to_string(),
                        "---PEM---".to_string(),
                    )])),
                    ..Default::default()
                }))
            });
        client
            .expect_reconcile_shared_config_map()
            .withf(|copy| {
                copy.metadata.name.as_deref() == Some(GLOBAL_CA_BUNDLE_CONFIG_MAP)
                    && copy.metadata.namespace.as_deref() == Some("ml")
                    && copy.metadata.owner_references.is_none()
                    && copy
                        .data
                        .as_ref()
                        .is_some_and(|d| d.contains_key("cabundle.crt"))
            })
            .times(1)
            .returning(|copy| Ok(copy));
        client
            .expect_reconcile_deployment()
            .returning(|_, desired| Ok(available_deployment(desired)));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client.expect_delete_http_route().returning(|_, _| Ok(()));
        client.expect_delete_service().returning(|_, _| Ok(()));
        client.expect_delete_pool().returning(|_, _| Ok(()));
        client.expect_delete_legacy_pool().returning(|_, _| Ok(()));
        client.expect_delete_role_binding().returning(|_, _| Ok(()));
        client.expect_delete_role().returning(|_, _| Ok(()));
        client.expect_patch_status().returning(|_, _| Ok(()));

        let ctx = Arc::new(InferenceContext {
            client: Arc::new(client),
            config: OperatorConfig {
                ca_bundle_config_map: Some("trellis-ca".to_string()),
                ..Default::default()
            },
            events: Arc::new(NoopEventPublisher),
        });
        reconcile(Arc::clone(&tis), ctx).await.expect("reconcile");
    }

    /// Story: error policy backs off on transient errors and waits for a
    /// spec change otherwise.
    #[test]
    fn story_error_policy_splits_on_retryability() {
        let tis = Arc::new(instance());
        let ctx = Arc::new(InferenceContext::for_testing(Arc::new(
            MockChildClient::new(),
        )));

        let configuration = Error::configuration("bad spec");
        assert_eq!(
            error_policy(Arc::clone(&tis), &configuration, Arc::clone(&ctx)),
            Action::await_change()
        );

        let transient = Error::internal("etcd hiccup");
        assert_eq!(
            error_policy(tis, &transient, ctx),
            Action::requeue(ERROR_RETRY_INTERVAL)
        );
    }

    /// An unready workload pins Ready to false and names the laggard.
    #[tokio::test]
    async fn unready_workload_blocks_the_ready_condition() {
        let tis = Arc::new(instance());

        let mut client = MockChildClient::new();
        client
            .expect_delete_service_account()
            .returning(|_, _| Ok(()));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(None));
        client.expect_get_secret().returning(|_, _| Ok(None));
        // Deployment comes back without an Available condition
        client
            .expect_reconcile_deployment()
            .returning(|_, desired| Ok(desired));
        client
            .expect_delete_leader_worker_set()
            .returning(|_, _| Ok(()));
        client.expect_delete_deployment().returning(|_, _| Ok(()));
        client
            .expect_reconcile_service()
            .returning(|_, desired| Ok(desired));
        client
            .expect_ensure_tls_secret()
            .returning(|_, desired| Ok(desired));
        client.expect_delete_http_route().returning(|_, _| Ok(()));
        client.expect_delete_service().returning(|_, _| Ok(()));
        client.expect_delete_pool().returning(|_, _| Ok(()));
        client.expect_delete_legacy_pool().returning(|_, _| Ok(()));
        client.expect_delete_role_binding().returning(|_, _| Ok(()));
        client.expect_delete_role().returning(|_, _| Ok(()));
        let captured = capture_status(&mut client);

        reconcile(Arc::clone(&tis), context(client))
            .await
            .expect("reconcile");

        let status = captured.lock().unwrap().clone().expect("status patched");
        let main = condition(&status, CONDITION_MAIN_WORKLOAD_READY);
        assert_eq!(main.status, "False");
        assert_eq!(main.reason, "Progressing");
        let ready = condition(&status, CONDITION_READY);
        assert_eq!(ready.status, "False");
        assert!(ready.message.contains(CONDITION_MAIN_WORKLOAD_READY));
    }
}

//! Endpoint-picker scheduler: Deployment, Service, RBAC, inference pools
//!
//! The scheduler (EPP) watches the serving pods and picks the endpoint for
//! each request. Its children exist only while `router.scheduler` is
//! configured. During the pool API migration the pool exists in both
//! generations under the same name; the route decides which one it
//! references.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;

use trellis_common::crd::networking::{
    EndpointPickerRef, ExtensionReference, InferencePool, InferencePoolLegacy,
    InferencePoolLegacySpec, InferencePoolSpec, PoolPort, PoolSelector, LEGACY_POOL_GROUP,
    POOL_GROUP,
};
use trellis_common::crd::{SchedulerConfigRef, SchedulerSpec, TrellisInferenceService};
use trellis_common::kube_utils::{child_metadata, child_name};
use trellis_common::{Error, Result, MAIN_CONTAINER_NAME};

use crate::config::OperatorConfig;
use crate::identity::WorkloadRole;
use crate::router::SERVING_PORT;
use crate::workload::selector_labels;

const COMPONENT: &str = "scheduler";

/// Port the endpoint picker serves its ext-proc gRPC API on
pub const GRPC_PORT: i32 = 9002;
/// gRPC health-check port
pub const GRPC_HEALTH_PORT: i32 = 9003;
/// Prometheus metrics port
pub const METRICS_PORT: i32 = 9090;

/// Default data key for config-map-sourced scheduler configuration
pub const DEFAULT_CONFIG_KEY: &str = "config.yaml";

/// Service port names the scheduler Service exposes from the pod template
const EXPOSED_PORT_NAMES: [&str; 3] = ["grpc", "grpc-health", "metrics"];

// ===== Child names =====

/// Name of the inference pool, shared by both API generations
pub fn pool_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-pool")
}

/// Name of the endpoint-picker Deployment
pub fn deployment_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-scheduler")
}

/// Name of the endpoint-picker Service
pub fn service_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-scheduler-svc")
}

/// Name of the endpoint-picker Role
pub fn role_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-scheduler-role")
}

/// Name of the endpoint-picker RoleBinding
pub fn role_binding_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-scheduler-rb")
}

/// Name of the scheduler's ServiceAccount.
///
/// A service-account name on the scheduler pod template overrides the
/// managed name; the account is still created and bound either way.
pub fn service_account_name(instance: &TrellisInferenceService) -> String {
    scheduler_spec(instance)
        .and_then(|s| s.template.as_ref())
        .and_then(|t| t.service_account_name.as_deref())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| child_name(&instance.name_any(), "-scheduler-sa"))
}

/// Whether scheduler children should exist for this instance
pub fn scheduler_enabled(instance: &TrellisInferenceService) -> bool {
    scheduler_spec(instance).is_some()
}

fn scheduler_spec(instance: &TrellisInferenceService) -> Option<&SchedulerSpec> {
    instance
        .spec
        .router
        .as_ref()
        .and_then(|r| r.scheduler.as_ref())
}

/// Labels shared by the scheduler Deployment, its pods, and its Service
/// selector.
pub fn scheduler_labels(instance: &TrellisInferenceService) -> BTreeMap<String, String> {
    use trellis_common::{LABEL_COMPONENT, LABEL_NAME, LABEL_PART_OF, PART_OF_VALUE};
    BTreeMap::from([
        (LABEL_NAME.to_string(), instance.name_any()),
        (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT.to_string()),
    ])
}

// ===== Configuration resolution =====

/// Where the endpoint-picker configuration comes from.
///
/// Inline wins over a config-map reference when both are set.
#[derive(Debug, PartialEq)]
pub enum ConfigSource<'a> {
    /// Inline document on the spec, rendered to YAML
    Inline(&'a Value),
    /// ConfigMap reference the controller must fetch
    ConfigMap(&'a SchedulerConfigRef),
    /// Generated default profile
    Default,
}

/// Decide the configuration source for this instance.
pub fn config_source(instance: &TrellisInferenceService) -> ConfigSource<'_> {
    let Some(config) = scheduler_spec(instance).and_then(|s| s.config.as_ref()) else {
        return ConfigSource::Default;
    };
    if let Some(inline) = config.inline.as_ref() {
        return ConfigSource::Inline(inline);
    }
    if let Some(reference) = config.config_map.as_ref() {
        return ConfigSource::ConfigMap(reference);
    }
    ConfigSource::Default
}

/// Render an inline configuration document to YAML.
pub fn render_inline_config(value: &Value) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::serialization_for_kind("EndpointPickerConfig", e.to_string()))
}

/// Extract the configuration text from a fetched ConfigMap.
///
/// A reference naming a key that does not exist in the map is a
/// configuration error, not a retryable one.
pub fn config_text_from_map(
    instance: &TrellisInferenceService,
    reference: &SchedulerConfigRef,
    map: &ConfigMap,
) -> Result<String> {
    let key = reference.key.as_deref().unwrap_or(DEFAULT_CONFIG_KEY);
    map.data
        .as_ref()
        .and_then(|data| data.get(key))
        .cloned()
        .ok_or_else(|| {
            Error::configuration_for_field(
                instance.name_any(),
                "spec.router.scheduler.config.configMap",
                format!(
                    "config map {:?} has no key {key:?}",
                    map.name_any()
                ),
            )
        })
}

/// Generated endpoint-picker configuration.
///
/// Disaggregated instances get a prefill/decode profile pair; everything
/// else gets the single default profile.
pub fn default_config_text(instance: &TrellisInferenceService) -> String {
    if instance.spec.prefill.is_some() {
        r#"apiVersion: inference.networking.x-k8s.io/v1alpha1
kind: EndpointPickerConfig
plugins:
- type: pd-profile-handler
  parameters:
    threshold: 100
- type: prefill-header-handler
- type: prefill-filter
- type: decode-filter
- type: prefix-cache-scorer
- type: load-aware-scorer
- type: max-score-picker
schedulingProfiles:
- name: prefill
  plugins:
  - pluginRef: prefill-filter
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
- name: decode
  plugins:
  - pluginRef: decode-filter
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
"#
        .to_string()
    } else {
        r#"apiVersion: inference.networking.x-k8s.io/v1alpha1
kind: EndpointPickerConfig
plugins:
- type: single-profile-handler
- type: prefix-cache-scorer
- type: load-aware-scorer
- type: max-score-picker
schedulingProfiles:
- name: default
  plugins:
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
"#
        .to_string()
    }
}

// ===== Pod spec =====

/// Effective scheduler pod spec: the user template, or a generated
/// endpoint-picker container when none is given. Either way the pod runs
/// as the scheduler's service account unless the template pins one.
fn effective_pod_spec(instance: &TrellisInferenceService, config: &OperatorConfig) -> PodSpec {
    let mut pod_spec = scheduler_spec(instance)
        .and_then(|s| s.template.clone())
        .unwrap_or_else(|| default_pod_spec(instance, config));
    if pod_spec
        .service_account_name
        .as_deref()
        .map_or(true, str::is_empty)
    {
        pod_spec.service_account_name = Some(service_account_name(instance));
    }
    pod_spec
}

fn default_pod_spec(instance: &TrellisInferenceService, config: &OperatorConfig) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: MAIN_CONTAINER_NAME.to_string(),
            image: Some(config.endpoint_picker_image.clone()),
            args: Some(vec![
                "--pool-name".to_string(),
                pool_name(instance),
                "--pool-namespace".to_string(),
                instance.namespace().unwrap_or_default(),
                "--grpc-port".to_string(),
                GRPC_PORT.to_string(),
                "--grpc-health-port".to_string(),
                GRPC_HEALTH_PORT.to_string(),
            ]),
            ports: Some(vec![
                named_port("grpc", GRPC_PORT),
                named_port("grpc-health", GRPC_HEALTH_PORT),
                named_port("metrics", METRICS_PORT),
            ]),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn named_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

// ===== Children =====

/// Build the endpoint-picker Deployment.
///
/// `config_text` is the resolved configuration; it is appended to the main
/// container as `--config-text` unless the template already carries a
/// config flag of its own.
pub fn deployment(
    instance: &TrellisInferenceService,
    config: &OperatorConfig,
    config_text: &str,
) -> Deployment {
    let labels = scheduler_labels(instance);
    let mut pod_spec = effective_pod_spec(instance, config);

    if let Some(main) = pod_spec
        .containers
        .iter_mut()
        .find(|c| c.name == MAIN_CONTAINER_NAME)
    {
        let args = main.args.get_or_insert_with(Vec::new);
        let overridden = args.iter().any(|arg| {
            matches!(
                arg.as_str(),
                "--config-text" | "-config-text" | "--config-file" | "-config-file"
            )
        });
        if !overridden {
            args.push("--config-text".to_string());
            args.push(config_text.to_string());
        }
    }

    Deployment {
        metadata: child_metadata(instance, &deployment_name(instance), COMPONENT),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the endpoint-picker Service.
///
/// Ports are lifted from the effective pod spec's named container ports
/// (`grpc`, `grpc-health`, `metrics`), so a template that moves a port
/// moves the Service with it.
pub fn service(instance: &TrellisInferenceService, config: &OperatorConfig) -> Service {
    let pod_spec = effective_pod_spec(instance, config);

    // BTreeMap keeps the ports sorted by name
    let mut exposed: BTreeMap<String, ContainerPort> = BTreeMap::new();
    for container in &pod_spec.containers {
        for port in container.ports.as_deref().unwrap_or_default() {
            if let Some(name) = port.name.as_deref() {
                if EXPOSED_PORT_NAMES.contains(&name) {
                    exposed.insert(name.to_string(), port.clone());
                }
            }
        }
    }

    let ports = exposed
        .into_iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.clone()),
            port: port.container_port,
            target_port: Some(IntOrString::String(name)),
            protocol: port.protocol,
            ..Default::default()
        })
        .collect();

    Service {
        metadata: child_metadata(instance, &service_name(instance), COMPONENT),
        spec: Some(ServiceSpec {
            selector: Some(scheduler_labels(instance)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the scheduler's ServiceAccount.
pub fn service_account(instance: &TrellisInferenceService) -> ServiceAccount {
    ServiceAccount {
        metadata: child_metadata(instance, &service_account_name(instance), COMPONENT),
        ..Default::default()
    }
}

/// Build the Role granting what the endpoint picker reads and reviews.
pub fn role(instance: &TrellisInferenceService) -> Role {
    Role {
        metadata: child_metadata(instance, &role_name(instance), COMPONENT),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: read_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![
                    LEGACY_POOL_GROUP.to_string(),
                    POOL_GROUP.to_string(),
                ]),
                resources: Some(vec![
                    "inferencepools".to_string(),
                    "inferencemodels".to_string(),
                ]),
                verbs: read_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                resources: Some(vec!["endpointslices".to_string()]),
                verbs: read_verbs(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["authentication.k8s.io".to_string()]),
                resources: Some(vec![
                    "tokenreviews".to_string(),
                    "subjectaccessreviews".to_string(),
                ]),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]),
    }
}

fn read_verbs() -> Vec<String> {
    vec![
        "get".to_string(),
        "list".to_string(),
        "watch".to_string(),
    ]
}

/// Build the RoleBinding attaching the scheduler's account to its Role.
pub fn role_binding(instance: &TrellisInferenceService) -> RoleBinding {
    RoleBinding {
        metadata: child_metadata(instance, &role_binding_name(instance), COMPONENT),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(instance),
            namespace: instance.namespace(),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name(instance),
        },
    }
}

// ===== Inference pools =====

/// Build the legacy-generation pool.
pub fn legacy_pool(instance: &TrellisInferenceService) -> InferencePoolLegacy {
    InferencePoolLegacy {
        metadata: child_metadata(instance, &pool_name(instance), COMPONENT),
        spec: InferencePoolLegacySpec {
            selector: selector_labels(instance, WorkloadRole::Main),
            target_port_number: SERVING_PORT,
            extension_ref: Some(ExtensionReference {
                name: service_name(instance),
                port_number: Some(GRPC_PORT),
                ..Default::default()
            }),
        },
    }
}

/// Build the current-generation pool.
pub fn pool(instance: &TrellisInferenceService) -> InferencePool {
    InferencePool {
        metadata: child_metadata(instance, &pool_name(instance), COMPONENT),
        spec: InferencePoolSpec {
            selector: PoolSelector {
                match_labels: selector_labels(instance, WorkloadRole::Main),
            },
            target_ports: vec![PoolPort {
                number: SERVING_PORT,
            }],
            endpoint_picker_ref: Some(EndpointPickerRef {
                name: service_name(instance),
                port: Some(PoolPort { number: GRPC_PORT }),
                ..Default::default()
            }),
        },
        status: None,
    }
}

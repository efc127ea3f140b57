//! Model storage wiring for serving pods
//!
//! Given a model URI, mutates a pod spec so the serving container finds the
//! model under the standard mount path. The backend is selected purely by
//! URI scheme:
//!
//! - `pvc://claim/path` mounts the claim directly, read-only
//! - `oci://image` runs the image as a "modelcar" sidecar sharing its
//!   filesystem through the pod's process namespace
//! - `hf://` and `s3://` download through a storage-initializer init
//!   container, with credentials resolved from the pod's service account
//!
//! All mutations are idempotent; attaching to an already-wired pod spec
//! changes nothing. An explicit `enabled: false` on the model's storage
//! spec skips every backend.

pub mod credentials;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource,
    PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use trellis_common::crd::TrellisInferenceService;
use trellis_common::{Error, Result, MAIN_CONTAINER_NAME};

use crate::config::OperatorConfig;
use credentials::{
    inject_hf_credentials, inject_s3_credentials, CredentialContext, ENV_AWS_CA_BUNDLE,
    ENV_AWS_CA_BUNDLE_CONFIG_MAP,
};

// ===== Naming =====

/// Directory the model is made available at inside serving containers
pub const MODEL_MOUNT_PATH: &str = "/mnt/models";
/// Init container that downloads hf:// and s3:// models
pub const STORAGE_INITIALIZER_CONTAINER: &str = "storage-initializer";
/// Sidecar exposing an oci:// model image
pub const MODELCAR_CONTAINER: &str = "modelcar";
/// Init container pre-fetching and validating the oci:// model image
pub const MODELCAR_INIT_CONTAINER: &str = "modelcar-init";
/// Volume backing the pvc:// direct mount
pub const PVC_VOLUME: &str = "model-source";
/// Shared empty-dir between the modelcar sidecar and the main container
pub const OCI_VOLUME: &str = "model-dir";
/// Empty-dir the storage-initializer downloads into
pub const PROVISION_VOLUME: &str = "model-provision";
/// ConfigMap volume carrying extra CA certificates for s3:// downloads
pub const CA_BUNDLE_VOLUME: &str = "ca-bundle";
/// Copy of the system CA bundle materialized in workload namespaces
pub const GLOBAL_CA_BUNDLE_CONFIG_MAP: &str = "global-ca-bundle";

/// Tells the serving engine the model directory may appear late (modelcar)
pub const MODEL_INIT_MODE_ENV: &str = "MODEL_INIT_MODE";
/// Final CA bundle config-map name, recorded for the downloader
pub const CA_BUNDLE_CONFIG_MAP_NAME_ENV: &str = "CA_BUNDLE_CONFIGMAP_NAME";
/// Final CA bundle mount directory, recorded for the downloader
pub const CA_BUNDLE_MOUNT_POINT_ENV: &str = "CA_BUNDLE_VOLUME_MOUNT_POINT";

const TERMINATION_POLICY_FALLBACK: &str = "FallbackToLogsOnError";

/// Side effects of an attachment the controller must follow up on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageAttachment {
    /// ConfigMap the CA bundle volume references, when one was injected
    pub ca_bundle_config_map: Option<String>,
}

impl StorageAttachment {
    /// Whether the pod references the per-namespace global CA bundle copy,
    /// which the controller must materialize from the system namespace.
    pub fn requires_global_ca_bundle(&self) -> bool {
        self.ca_bundle_config_map.as_deref() == Some(GLOBAL_CA_BUNDLE_CONFIG_MAP)
    }

    fn merge(&mut self, other: StorageAttachment) {
        if other.ca_bundle_config_map.is_some() {
            self.ca_bundle_config_map = other.ca_bundle_config_map;
        }
    }
}

/// Attaches model storage to pod specs according to the instance's model URI.
pub struct ModelStorage<'a> {
    config: &'a OperatorConfig,
}

impl<'a> ModelStorage<'a> {
    /// Create an attacher over the operator configuration.
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self { config }
    }

    /// Wire the instance's model into the given pod spec.
    ///
    /// Returns what was attached so the controller can reconcile follow-up
    /// children (the global CA bundle copy). A disabled storage spec skips
    /// everything, including credential injection, for every scheme.
    pub fn attach(
        &self,
        instance: &TrellisInferenceService,
        pod_spec: &mut PodSpec,
        credentials: &CredentialContext,
    ) -> Result<StorageAttachment> {
        if !instance.spec.model.storage_enabled() {
            return Ok(StorageAttachment::default());
        }

        let uri = instance.spec.model.uri.clone();
        let Some((scheme, _)) = uri.split_once("://") else {
            return Err(Error::configuration_for_field(
                instance.name_any(),
                "spec.model.uri",
                format!("invalid model URI {uri:?}"),
            ));
        };

        match scheme {
            "pvc" => {
                self.attach_pvc(instance, &uri, pod_spec)?;
                Ok(StorageAttachment::default())
            }
            "oci" => {
                self.attach_oci(instance, &uri, pod_spec)?;
                Ok(StorageAttachment::default())
            }
            "hf" => {
                self.attach_initializer(&uri, pod_spec);
                if let Some(init) = init_container_mut(pod_spec, STORAGE_INITIALIZER_CONTAINER) {
                    inject_hf_credentials(init, credentials);
                }
                Ok(StorageAttachment::default())
            }
            "s3" => {
                self.attach_initializer(&uri, pod_spec);
                if let Some(init) = init_container_mut(pod_spec, STORAGE_INITIALIZER_CONTAINER) {
                    inject_s3_credentials(init, credentials, instance.metadata.annotations.as_ref());
                }
                let ca_bundle_config_map =
                    self.inject_ca_bundle(&instance.namespace().unwrap_or_default(), pod_spec);
                Ok(StorageAttachment { ca_bundle_config_map })
            }
            other => Err(Error::configuration_for_field(
                instance.name_any(),
                "spec.model.uri",
                format!("unsupported storage scheme {other:?}"),
            )),
        }
    }

    /// Apply [`attach`](Self::attach) across several pod specs of one role
    /// set, merging the follow-up summaries.
    pub fn attach_all(
        &self,
        instance: &TrellisInferenceService,
        pod_specs: &mut [&mut PodSpec],
        credentials: &CredentialContext,
    ) -> Result<StorageAttachment> {
        let mut summary = StorageAttachment::default();
        for pod_spec in pod_specs {
            summary.merge(self.attach(instance, pod_spec, credentials)?);
        }
        Ok(summary)
    }

    fn attach_pvc(
        &self,
        instance: &TrellisInferenceService,
        uri: &str,
        pod_spec: &mut PodSpec,
    ) -> Result<()> {
        let (claim, sub_path) = parse_pvc_uri(uri).ok_or_else(|| {
            Error::configuration_for_field(
                instance.name_any(),
                "spec.model.uri",
                format!("invalid pvc URI {uri:?}, expected pvc://<claim>[/path]"),
            )
        })?;

        if let Some(main) = container_mut(pod_spec, MAIN_CONTAINER_NAME) {
            add_mount_if_absent(
                main,
                VolumeMount {
                    name: PVC_VOLUME.to_string(),
                    mount_path: MODEL_MOUNT_PATH.to_string(),
                    sub_path: (!sub_path.is_empty()).then(|| sub_path.clone()),
                    read_only: Some(true),
                    ..Default::default()
                },
            );
            add_volume_if_absent(
                pod_spec,
                Volume {
                    name: PVC_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    fn attach_oci(
        &self,
        instance: &TrellisInferenceService,
        uri: &str,
        pod_spec: &mut PodSpec,
    ) -> Result<()> {
        if !self.config.enable_modelcar {
            return Err(Error::configuration_for(
                instance.name_any(),
                "oci model storage is disabled",
            ));
        }
        let image = uri.trim_start_matches("oci://").to_string();
        let model_parent = parent_directory(MODEL_MOUNT_PATH).to_string();

        {
            let Some(main) = container_mut(pod_spec, MAIN_CONTAINER_NAME) else {
                return Err(Error::configuration_for(
                    instance.name_any(),
                    format!("pod template has no {MAIN_CONTAINER_NAME:?} container"),
                ));
            };
            // The sidecar links the model in after the serving engine may
            // already be probing the directory.
            add_or_replace_env(main, MODEL_INIT_MODE_ENV, "async");
            add_mount_if_absent(
                main,
                VolumeMount {
                    name: OCI_VOLUME.to_string(),
                    mount_path: model_parent.clone(),
                    ..Default::default()
                },
            );
        }

        add_volume_if_absent(
            pod_spec,
            Volume {
                name: OCI_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        );

        if container_mut(pod_spec, MODELCAR_CONTAINER).is_none() {
            pod_spec
                .containers
                .push(self.modelcar_container(&image, &model_parent));
            pod_spec
                .init_containers
                .get_or_insert_with(Vec::new)
                .push(self.modelcar_init_container(&image));
        }

        // The main container reaches the sidecar's filesystem via /proc
        pod_spec.share_process_namespace = Some(true);
        Ok(())
    }

    fn modelcar_container(&self, image: &str, model_parent: &str) -> Container {
        Container {
            name: MODELCAR_CONTAINER.to_string(),
            image: Some(image.to_string()),
            args: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                // $$$$ survives kubelet env expansion as $$, the shell PID
                format!("ln -sf /proc/$$$$/root/models {MODEL_MOUNT_PATH} && sleep infinity"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: OCI_VOLUME.to_string(),
                mount_path: model_parent.to_string(),
                ..Default::default()
            }]),
            resources: Some(resource_requirements(
                &self.config.modelcar_cpu,
                &self.config.modelcar_memory,
                &self.config.modelcar_cpu,
                &self.config.modelcar_memory,
            )),
            termination_message_policy: Some(TERMINATION_POLICY_FALLBACK.to_string()),
            ..Default::default()
        }
    }

    fn modelcar_init_container(&self, image: &str) -> Container {
        Container {
            name: MODELCAR_INIT_CONTAINER.to_string(),
            image: Some(image.to_string()),
            args: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "[ -d /models ] && [ \"$$(ls -A /models)\" ] || \
                     (echo 'modelcar image {image} has no /models content' && exit 1)"
                ),
            ]),
            resources: Some(resource_requirements(
                &self.config.modelcar_cpu,
                &self.config.modelcar_memory,
                &self.config.modelcar_cpu,
                &self.config.modelcar_memory,
            )),
            termination_message_policy: Some(TERMINATION_POLICY_FALLBACK.to_string()),
            ..Default::default()
        }
    }

    fn attach_initializer(&self, uri: &str, pod_spec: &mut PodSpec) {
        add_volume_if_absent(
            pod_spec,
            Volume {
                name: PROVISION_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        );

        if init_container_mut(pod_spec, STORAGE_INITIALIZER_CONTAINER).is_none() {
            pod_spec
                .init_containers
                .get_or_insert_with(Vec::new)
                .push(Container {
                    name: STORAGE_INITIALIZER_CONTAINER.to_string(),
                    image: Some(self.config.storage_initializer_image.clone()),
                    args: Some(vec![uri.to_string(), MODEL_MOUNT_PATH.to_string()]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: PROVISION_VOLUME.to_string(),
                        mount_path: MODEL_MOUNT_PATH.to_string(),
                        ..Default::default()
                    }]),
                    resources: Some(resource_requirements(
                        &self.config.storage_cpu_request,
                        &self.config.storage_memory_request,
                        &self.config.storage_cpu_limit,
                        &self.config.storage_memory_limit,
                    )),
                    termination_message_policy: Some(TERMINATION_POLICY_FALLBACK.to_string()),
                    ..Default::default()
                });
        }

        if let Some(main) = container_mut(pod_spec, MAIN_CONTAINER_NAME) {
            add_mount_if_absent(
                main,
                VolumeMount {
                    name: PROVISION_VOLUME.to_string(),
                    mount_path: MODEL_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            );
        }
    }

    /// Mount extra CA certificates into the storage-initializer.
    ///
    /// Triggered when a bundle is configured globally or the credential
    /// annotations already put a bundle config-map on the init container.
    /// Name and directory resolve annotation values over existing env vars
    /// over the namespace-scoped default; outside the system namespace the
    /// default is the per-namespace copy of the global bundle.
    fn inject_ca_bundle(&self, namespace: &str, pod_spec: &mut PodSpec) -> Option<String> {
        let config_map = {
            let init = init_container_mut(pod_spec, STORAGE_INITIALIZER_CONTAINER)?;

            let annotated = init
                .env
                .iter()
                .flatten()
                .any(|e| e.name == ENV_AWS_CA_BUNDLE_CONFIG_MAP);
            if self.config.ca_bundle_config_map.is_none() && !annotated {
                return None;
            }

            let mut config_map = if namespace != self.config.system_namespace {
                GLOBAL_CA_BUNDLE_CONFIG_MAP.to_string()
            } else {
                self.config
                    .ca_bundle_config_map
                    .clone()
                    .unwrap_or_else(|| GLOBAL_CA_BUNDLE_CONFIG_MAP.to_string())
            };
            let mut mount_path = self.config.ca_bundle_mount_path.clone();
            let mut name_env_exists = false;
            let mut path_env_exists = false;
            for env in init.env.iter().flatten() {
                match (env.name.as_str(), env.value.as_deref()) {
                    (ENV_AWS_CA_BUNDLE_CONFIG_MAP, Some(value)) => config_map = value.to_string(),
                    (ENV_AWS_CA_BUNDLE, Some(value)) => {
                        mount_path = parent_directory(value).to_string()
                    }
                    (CA_BUNDLE_CONFIG_MAP_NAME_ENV, _) => name_env_exists = true,
                    (CA_BUNDLE_MOUNT_POINT_ENV, _) => path_env_exists = true,
                    _ => {}
                }
            }

            // Existing values were customized by the user; never overwrite
            if !name_env_exists {
                push_env(init, CA_BUNDLE_CONFIG_MAP_NAME_ENV, &config_map);
            }
            if !path_env_exists {
                push_env(init, CA_BUNDLE_MOUNT_POINT_ENV, &mount_path);
            }
            add_mount_if_absent(
                init,
                VolumeMount {
                    name: CA_BUNDLE_VOLUME.to_string(),
                    mount_path,
                    read_only: Some(true),
                    ..Default::default()
                },
            );
            config_map
        };

        add_volume_if_absent(
            pod_spec,
            Volume {
                name: CA_BUNDLE_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        Some(config_map)
    }
}

// ===== Pod spec helpers =====

fn parse_pvc_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("pvc://")?;
    let (claim, path) = match rest.split_once('/') {
        Some((claim, path)) => (claim, path),
        None => (rest, ""),
    };
    if claim.is_empty() {
        return None;
    }
    Some((claim.to_string(), path.to_string()))
}

fn parent_directory(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn container_mut<'p>(pod_spec: &'p mut PodSpec, name: &str) -> Option<&'p mut Container> {
    pod_spec.containers.iter_mut().find(|c| c.name == name)
}

fn init_container_mut<'p>(pod_spec: &'p mut PodSpec, name: &str) -> Option<&'p mut Container> {
    pod_spec.init_containers.as_mut()?.iter_mut().find(|c| c.name == name)
}

fn add_volume_if_absent(pod_spec: &mut PodSpec, volume: Volume) {
    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == volume.name) {
        volumes.push(volume);
    }
}

fn add_mount_if_absent(container: &mut Container, mount: VolumeMount) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if !mounts.iter().any(|m| m.name == mount.name) {
        mounts.push(mount);
    }
}

fn add_or_replace_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }),
    }
}

fn push_env(container: &mut Container, name: &str, value: &str) {
    container.env.get_or_insert_with(Vec::new).push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    });
}

fn resource_requirements(
    cpu_request: &str,
    memory_request: &str,
    cpu_limit: &str,
    memory_limit: &str,
) -> ResourceRequirements {
    let entries = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(entries(cpu_request, memory_request)),
        limits: Some(entries(cpu_limit, memory_limit)),
        ..Default::default()
    }
}

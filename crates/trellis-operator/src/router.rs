//! Routing children: workload Service, serving TLS secret, managed HTTPRoute
//!
//! The Service fronts the serving pods in either topology (leader pods carry
//! the serving selector labels, workers behind a leader do not). The managed
//! route binds the configured gateways to the inference pool when a
//! scheduler is deployed, or straight to the Service otherwise. Pool
//! migration state decides which pool API group the route references.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, Ia5String,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};

use trellis_common::crd::networking::{
    HTTPBackendRef, HTTPPathMatch, HTTPRoute, HTTPRouteMatch, HTTPRouteRule, HTTPRouteSpec,
    ParentReference, GATEWAY_GROUP, LEGACY_POOL_GROUP, POOL_GROUP,
};
use trellis_common::crd::{PoolMigration, TrellisInferenceService};
use trellis_common::kube_utils::{child_metadata, child_name};
use trellis_common::{Error, Result};

use crate::identity::WorkloadRole;
use crate::scheduler;
use crate::workload::selector_labels;

/// Port the serving containers listen on
pub const SERVING_PORT: i32 = 8000;

/// Serving certificate lifetime. The secret is created once and never
/// rotated, so this is deliberately long.
const CERT_VALIDITY_YEARS: i64 = 10;

const COMPONENT: &str = "router";

/// Name of the Service fronting the serving pods
pub fn service_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-workload-svc")
}

/// Name of the serving TLS secret
pub fn tls_secret_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-workload-tls")
}

/// Name of the managed HTTPRoute
pub fn route_name(instance: &TrellisInferenceService) -> String {
    child_name(&instance.name_any(), "-route")
}

/// Whether a managed route should exist for this instance.
///
/// Requires at least one gateway ref; user-supplied route refs suppress the
/// managed route entirely.
pub fn managed_route_enabled(instance: &TrellisInferenceService) -> bool {
    instance.spec.router.as_ref().is_some_and(|router| {
        !router.has_user_routes()
            && router
                .gateway
                .as_ref()
                .is_some_and(|gateway| !gateway.refs.is_empty())
    })
}

/// Build the cluster-IP Service in front of the serving pods.
pub fn workload_service(instance: &TrellisInferenceService) -> Service {
    Service {
        metadata: child_metadata(instance, &service_name(instance), COMPONENT),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(instance, WorkloadRole::Main)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVING_PORT,
                target_port: Some(IntOrString::Int(SERVING_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the self-signed serving certificate secret.
///
/// Called only when the secret does not exist yet; reconciliation never
/// rewrites it, so serving pods keep a stable certificate across restarts.
pub fn tls_secret(instance: &TrellisInferenceService) -> Result<Secret> {
    let service = service_name(instance);
    let namespace = instance.namespace().unwrap_or_default();
    let sans = [
        service.clone(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ];
    let (cert_pem, key_pem) = self_signed_cert(&sans)?;

    Ok(Secret {
        metadata: child_metadata(instance, &tls_secret_name(instance), COMPONENT),
        type_: Some("kubernetes.io/tls".to_string()),
        string_data: Some(BTreeMap::from([
            ("tls.crt".to_string(), cert_pem),
            ("tls.key".to_string(), key_pem),
        ])),
        ..Default::default()
    })
}

fn self_signed_cert(sans: &[String]) -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(sans[0].clone()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("Trellis".to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(CERT_VALIDITY_YEARS * 365);

    params.subject_alt_names = sans
        .iter()
        .map(|san| {
            Ia5String::try_from(san.clone())
                .map(SanType::DnsName)
                .map_err(|e| Error::internal(format!("invalid DNS name {san:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let key = KeyPair::generate()
        .map_err(|e| Error::internal(format!("failed to generate serving key: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::internal(format!("failed to sign serving certificate: {e}")))?;

    Ok((cert.pem(), key.serialize_pem()))
}

/// Backend the managed route forwards to.
///
/// With a scheduler the route targets the inference pool, in the API group
/// the migration state selects; without one it targets the workload Service
/// directly.
pub fn backend_ref(instance: &TrellisInferenceService) -> HTTPBackendRef {
    let scheduler_managed = instance
        .spec
        .router
        .as_ref()
        .is_some_and(|r| r.scheduler.is_some());
    if scheduler_managed {
        let group = match instance.pool_migration() {
            PoolMigration::Migrated => POOL_GROUP,
            PoolMigration::NotMigrated => LEGACY_POOL_GROUP,
        };
        HTTPBackendRef {
            group: Some(group.to_string()),
            kind: Some("InferencePool".to_string()),
            name: scheduler::pool_name(instance),
            ..Default::default()
        }
    } else {
        HTTPBackendRef {
            name: service_name(instance),
            port: Some(SERVING_PORT),
            ..Default::default()
        }
    }
}

/// Build the managed HTTPRoute for the configured gateways.
pub fn http_route(instance: &TrellisInferenceService) -> HTTPRoute {
    let gateway_refs = instance
        .spec
        .router
        .as_ref()
        .and_then(|r| r.gateway.as_ref())
        .map(|g| g.refs.as_slice())
        .unwrap_or_default();

    let parent_refs = gateway_refs
        .iter()
        .map(|gateway| ParentReference {
            group: Some(GATEWAY_GROUP.to_string()),
            kind: Some("Gateway".to_string()),
            name: gateway.name.clone(),
            namespace: gateway.namespace.clone(),
            section_name: None,
        })
        .collect();

    HTTPRoute {
        metadata: child_metadata(instance, &route_name(instance), COMPONENT),
        spec: HTTPRouteSpec {
            parent_refs,
            hostnames: vec![],
            rules: vec![HTTPRouteRule {
                matches: vec![HTTPRouteMatch {
                    path: Some(HTTPPathMatch {
                        type_: Some("PathPrefix".to_string()),
                        value: Some("/".to_string()),
                    }),
                }],
                backend_refs: vec![backend_ref(instance)],
            }],
        },
    }
}

//! Model-download credential injection
//!
//! Credentials are discovered through the pod's service account: the first
//! secret it lists with a recognized data key supplies the static keys, and
//! connection settings (endpoint, region, TLS flags, CA bundle) ride along
//! as annotations on that secret. With an IAM role annotation on the
//! service account itself there are no static keys and the same connection
//! annotations are read from the service account instead. Annotations on
//! the instance override both.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Secret, SecretKeySelector, ServiceAccount,
};

// ===== Annotations =====

/// S3 endpoint host:port, for non-AWS object stores
pub const S3_ENDPOINT_ANNOTATION: &str = "trellis.dev/s3-endpoint";
/// `"0"` disables https on the derived endpoint URL
pub const S3_USE_HTTPS_ANNOTATION: &str = "trellis.dev/s3-usehttps";
/// AWS region
pub const S3_REGION_ANNOTATION: &str = "trellis.dev/s3-region";
/// Whether the downloader verifies the server certificate
pub const S3_VERIFY_SSL_ANNOTATION: &str = "trellis.dev/s3-verifyssl";
/// `"true"` downloads anonymously, even if static keys exist
pub const S3_ANONYMOUS_ANNOTATION: &str = "trellis.dev/s3-useanoncredential";
/// Path of the CA bundle file inside its mounted config map
pub const S3_CA_BUNDLE_ANNOTATION: &str = "trellis.dev/s3-cabundle";
/// ConfigMap holding the CA bundle, in the instance namespace
pub const S3_CA_BUNDLE_CONFIG_MAP_ANNOTATION: &str = "trellis.dev/s3-cabundle-configmap";
/// AWS IAM role for service accounts (IRSA); presence selects the
/// keyless credential path
pub const IAM_ROLE_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

// ===== Secret data keys =====

/// Access-key-id entry in a credential secret
pub const ACCESS_KEY_ID_KEY: &str = "awsAccessKeyID";
/// Secret-access-key entry in a credential secret
pub const SECRET_ACCESS_KEY_KEY: &str = "awsSecretAccessKey";
/// Hugging Face token entry in a credential secret
pub const HF_TOKEN_KEY: &str = "HF_TOKEN";

// ===== Environment variables consumed by the downloader =====

/// AWS access key id
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// AWS secret access key
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Raw endpoint host:port
pub const ENV_S3_ENDPOINT: &str = "S3_ENDPOINT";
/// Endpoint with scheme, derived from the endpoint and https annotations
pub const ENV_AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
/// Pass-through of the https annotation
pub const ENV_S3_USE_HTTPS: &str = "S3_USE_HTTPS";
/// Pass-through of the verify-ssl annotation
pub const ENV_S3_VERIFY_SSL: &str = "S3_VERIFY_SSL";
/// Pass-through of the anonymous-credential annotation
pub const ENV_AWS_ANONYMOUS_CREDENTIAL: &str = "awsAnonymousCredential";
/// AWS region
pub const ENV_AWS_REGION: &str = "AWS_DEFAULT_REGION";
/// ConfigMap name carrying the CA bundle, read back by the attacher for
/// the volume wiring
pub const ENV_AWS_CA_BUNDLE_CONFIG_MAP: &str = "AWS_CA_BUNDLE_CONFIGMAP";
/// Full path of the CA bundle file inside the container
pub const ENV_AWS_CA_BUNDLE: &str = "AWS_CA_BUNDLE";
/// Hugging Face token
pub const ENV_HF_TOKEN: &str = "HF_TOKEN";

/// Service-account credential material fetched before pod mutation.
///
/// The controller resolves the pod's service account (falling back to the
/// namespace's `default` account) and the secrets it lists; the attacher
/// then works purely on this snapshot.
#[derive(Clone, Debug, Default)]
pub struct CredentialContext {
    /// The resolved service account, if it exists
    pub service_account: Option<ServiceAccount>,
    /// Secrets listed by the service account, in listing order
    pub secrets: Vec<Secret>,
}

impl CredentialContext {
    /// IAM role annotations, when the service account opts into IRSA.
    fn iam_annotations(&self) -> Option<&BTreeMap<String, String>> {
        let annotations = self.service_account.as_ref()?.metadata.annotations.as_ref()?;
        annotations.contains_key(IAM_ROLE_ANNOTATION).then_some(annotations)
    }

    /// First listed secret containing the given data key.
    fn secret_with_key(&self, key: &str) -> Option<&Secret> {
        self.secrets
            .iter()
            .find(|s| s.data.as_ref().is_some_and(|d| d.contains_key(key)))
    }
}

/// Inject a Hugging Face token from the service account's secrets.
///
/// No-op when no listed secret carries the token key.
pub fn inject_hf_credentials(init_container: &mut Container, credentials: &CredentialContext) {
    let Some(secret) = credentials.secret_with_key(HF_TOKEN_KEY) else {
        return;
    };
    let Some(secret_name) = secret.metadata.name.clone() else {
        return;
    };
    push_env(
        init_container,
        secret_key_env(ENV_HF_TOKEN, &secret_name, HF_TOKEN_KEY),
    );
}

/// Inject S3 credentials and connection settings.
///
/// Resolution order: IAM role on the service account (keyless, settings
/// from the service-account annotations), then the first listed secret
/// holding a secret-access-key (static key refs plus settings from the
/// secret annotations). Instance annotations override either source. An
/// anonymous-credential annotation suppresses the static key refs.
pub fn inject_s3_credentials(
    init_container: &mut Container,
    credentials: &CredentialContext,
    instance_annotations: Option<&BTreeMap<String, String>>,
) {
    if let Some(sa_annotations) = credentials.iam_annotations() {
        let settings = merged_annotations(sa_annotations, instance_annotations);
        for env in s3_config_env(&settings) {
            push_env(init_container, env);
        }
        return;
    }

    let Some(secret) = credentials.secret_with_key(SECRET_ACCESS_KEY_KEY) else {
        return;
    };
    let Some(secret_name) = secret.metadata.name.clone() else {
        return;
    };
    let empty = BTreeMap::new();
    let secret_annotations = secret.metadata.annotations.as_ref().unwrap_or(&empty);
    let settings = merged_annotations(secret_annotations, instance_annotations);

    if !is_anonymous(&settings) {
        push_env(
            init_container,
            secret_key_env(ENV_AWS_ACCESS_KEY_ID, &secret_name, ACCESS_KEY_ID_KEY),
        );
        push_env(
            init_container,
            secret_key_env(ENV_AWS_SECRET_ACCESS_KEY, &secret_name, SECRET_ACCESS_KEY_KEY),
        );
    }
    for env in s3_config_env(&settings) {
        push_env(init_container, env);
    }
}

/// Value env vars derived from S3 connection annotations.
///
/// Only annotations that are actually present produce an env var, except
/// the endpoint URL which is derived from the endpoint and https flags.
pub fn s3_config_env(annotations: &BTreeMap<String, String>) -> Vec<EnvVar> {
    let mut env = Vec::new();
    let mut push = |name: &str, value: String| {
        env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        });
    };

    let use_https = annotations.get(S3_USE_HTTPS_ANNOTATION);
    if let Some(v) = use_https {
        push(ENV_S3_USE_HTTPS, v.clone());
    }
    if let Some(endpoint) = annotations.get(S3_ENDPOINT_ANNOTATION) {
        push(ENV_S3_ENDPOINT, endpoint.clone());
        let scheme = match use_https.map(String::as_str) {
            Some("0") => "http",
            _ => "https",
        };
        push(ENV_AWS_ENDPOINT_URL, format!("{scheme}://{endpoint}"));
    }
    if let Some(v) = annotations.get(S3_ANONYMOUS_ANNOTATION) {
        push(ENV_AWS_ANONYMOUS_CREDENTIAL, v.clone());
    }
    if let Some(v) = annotations.get(S3_REGION_ANNOTATION) {
        push(ENV_AWS_REGION, v.clone());
    }
    if let Some(v) = annotations.get(S3_VERIFY_SSL_ANNOTATION) {
        push(ENV_S3_VERIFY_SSL, v.clone());
    }
    if let Some(v) = annotations.get(S3_CA_BUNDLE_CONFIG_MAP_ANNOTATION) {
        push(ENV_AWS_CA_BUNDLE_CONFIG_MAP, v.clone());
    }
    if let Some(v) = annotations.get(S3_CA_BUNDLE_ANNOTATION) {
        push(ENV_AWS_CA_BUNDLE, v.clone());
    }
    env
}

fn is_anonymous(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(S3_ANONYMOUS_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn merged_annotations(
    base: &BTreeMap<String, String>,
    overrides: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            if key.starts_with("trellis.dev/s3-") {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn secret_key_env(env_name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: env_name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn push_env(container: &mut Container, env: EnvVar) {
    container.env.get_or_insert_with(Vec::new).push(env);
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn secret(name: &str, keys: &[&str], meta_annotations: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: (!meta_annotations.is_empty())
                    .then(|| annotations(meta_annotations)),
                ..Default::default()
            },
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"x".to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a EnvVar> {
        container.env.as_ref()?.iter().find(|e| e.name == name)
    }

    #[test]
    fn hf_token_comes_from_first_matching_secret() {
        let credentials = CredentialContext {
            service_account: None,
            secrets: vec![
                secret("unrelated", &["password"], &[]),
                secret("hf-creds", &[HF_TOKEN_KEY], &[]),
            ],
        };
        let mut init = Container::default();
        inject_hf_credentials(&mut init, &credentials);

        let token = env_value(&init, ENV_HF_TOKEN).expect("HF_TOKEN env");
        let key_ref = token
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .expect("secret key ref");
        assert_eq!(key_ref.name, "hf-creds");
        assert_eq!(key_ref.key, HF_TOKEN_KEY);
    }

    #[test]
    fn hf_injection_is_a_noop_without_token_secret() {
        let credentials = CredentialContext::default();
        let mut init = Container::default();
        inject_hf_credentials(&mut init, &credentials);
        assert!(init.env.is_none());
    }

    /// The endpoint URL scheme follows the https annotation: "0" means
    /// plain http, anything else stays https.
    #[test]
    fn endpoint_url_scheme_follows_https_flag() {
        let plain = s3_config_env(&annotations(&[
            (S3_ENDPOINT_ANNOTATION, "minio.ml:9000"),
            (S3_USE_HTTPS_ANNOTATION, "0"),
        ]));
        assert!(plain
            .iter()
            .any(|e| e.name == ENV_AWS_ENDPOINT_URL
                && e.value.as_deref() == Some("http://minio.ml:9000")));

        let secure = s3_config_env(&annotations(&[(S3_ENDPOINT_ANNOTATION, "minio.ml:9000")]));
        assert!(secure
            .iter()
            .any(|e| e.name == ENV_AWS_ENDPOINT_URL
                && e.value.as_deref() == Some("https://minio.ml:9000")));
    }

    #[test]
    fn secret_credentials_inject_key_refs_and_settings() {
        let credentials = CredentialContext {
            service_account: None,
            secrets: vec![secret(
                "s3-creds",
                &[ACCESS_KEY_ID_KEY, SECRET_ACCESS_KEY_KEY],
                &[
                    (S3_ENDPOINT_ANNOTATION, "h:9000"),
                    (S3_USE_HTTPS_ANNOTATION, "0"),
                    (S3_REGION_ANNOTATION, "r"),
                ],
            )],
        };
        let mut init = Container::default();
        inject_s3_credentials(&mut init, &credentials, None);

        let access = env_value(&init, ENV_AWS_ACCESS_KEY_ID).expect("access key env");
        assert_eq!(
            access
                .value_from
                .as_ref()
                .and_then(|v| v.secret_key_ref.as_ref())
                .map(|r| (r.name.as_str(), r.key.as_str())),
            Some(("s3-creds", ACCESS_KEY_ID_KEY))
        );
        assert!(env_value(&init, ENV_AWS_SECRET_ACCESS_KEY).is_some());
        assert_eq!(
            env_value(&init, ENV_S3_ENDPOINT).and_then(|e| e.value.as_deref()),
            Some("h:9000")
        );
        assert_eq!(
            env_value(&init, ENV_AWS_ENDPOINT_URL).and_then(|e| e.value.as_deref()),
            Some("http://h:9000")
        );
        assert_eq!(
            env_value(&init, ENV_AWS_REGION).and_then(|e| e.value.as_deref()),
            Some("r")
        );
    }

    /// An IAM role on the service account replaces static keys entirely;
    /// the connection settings come from the service-account annotations
    /// and produce the same env set minus the key refs.
    #[test]
    fn iam_role_injects_settings_without_static_keys() {
        let credentials = CredentialContext {
            service_account: Some(ServiceAccount {
                metadata: ObjectMeta {
                    name: Some("runner".to_string()),
                    annotations: Some(annotations(&[
                        (IAM_ROLE_ANNOTATION, "arn:aws:iam::1:role/s3access"),
                        (S3_ENDPOINT_ANNOTATION, "h:9000"),
                        (S3_USE_HTTPS_ANNOTATION, "0"),
                        (S3_REGION_ANNOTATION, "r"),
                    ])),
                    ..Default::default()
                },
                ..Default::default()
            }),
            // A keyed secret is also listed but must be ignored
            secrets: vec![secret(
                "s3-creds",
                &[ACCESS_KEY_ID_KEY, SECRET_ACCESS_KEY_KEY],
                &[],
            )],
        };
        let mut init = Container::default();
        inject_s3_credentials(&mut init, &credentials, None);

        assert!(env_value(&init, ENV_AWS_ACCESS_KEY_ID).is_none());
        assert!(env_value(&init, ENV_AWS_SECRET_ACCESS_KEY).is_none());
        assert_eq!(
            env_value(&init, ENV_AWS_ENDPOINT_URL).and_then(|e| e.value.as_deref()),
            Some("http://h:9000")
        );
        assert_eq!(
            env_value(&init, ENV_AWS_REGION).and_then(|e| e.value.as_deref()),
            Some("r")
        );
    }

    #[test]
    fn anonymous_annotation_suppresses_key_refs() {
        let credentials = CredentialContext {
            service_account: None,
            secrets: vec![secret(
                "s3-creds",
                &[ACCESS_KEY_ID_KEY, SECRET_ACCESS_KEY_KEY],
                &[(S3_ANONYMOUS_ANNOTATION, "true")],
            )],
        };
        let mut init = Container::default();
        inject_s3_credentials(&mut init, &credentials, None);

        assert!(env_value(&init, ENV_AWS_ACCESS_KEY_ID).is_none());
        assert_eq!(
            env_value(&init, ENV_AWS_ANONYMOUS_CREDENTIAL).and_then(|e| e.value.as_deref()),
            Some("true")
        );
    }

    #[test]
    fn instance_annotations_override_secret_annotations() {
        let credentials = CredentialContext {
            service_account: None,
            secrets: vec![secret(
                "s3-creds",
                &[ACCESS_KEY_ID_KEY, SECRET_ACCESS_KEY_KEY],
                &[(S3_REGION_ANNOTATION, "secret-region")],
            )],
        };
        let overrides = annotations(&[
            (S3_REGION_ANNOTATION, "instance-region"),
            // Non-storage annotations never leak into the settings
            ("trellis.dev/stop", "true"),
        ]);
        let mut init = Container::default();
        inject_s3_credentials(&mut init, &credentials, Some(&overrides));

        assert_eq!(
            env_value(&init, ENV_AWS_REGION).and_then(|e| e.value.as_deref()),
            Some("instance-region")
        );
    }
}

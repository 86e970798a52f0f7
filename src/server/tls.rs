//! Serving certificates for the validating webhook
//!
//! The apiserver only calls webhooks over HTTPS, so on startup the
//! controller makes sure a CA and a serving certificate exist:
//!
//! ```text
//! Self-signed CA (triton-webhook-ca)
//!     └── Server cert (triton-controller.triton-system.svc)
//! ```
//!
//! Both live in a `kubernetes.io/tls` Secret so every replica serves the
//! same chain, and the CA is injected into the caBundle of every webhook in
//! the `ValidatingWebhookConfiguration`.

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const CA_VALIDITY_DAYS: i64 = 3650;
pub const SERVER_VALIDITY_DAYS: i64 = 365;

pub const SECRET_CA_CERT_KEY: &str = "ca.crt";
pub const SECRET_SERVER_CERT_KEY: &str = "tls.crt";
pub const SECRET_SERVER_KEY_KEY: &str = "tls.key";

pub const DEFAULT_TLS_SECRET_NAME: &str = "triton-webhook-tls";
pub const DEFAULT_WEBHOOK_CONFIG_NAME: &str = "triton-validating-webhook";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("invalid DNS name {name}: {reason}")]
    InvalidDnsName { name: String, reason: String },

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid PEM data")]
    InvalidPem,
}

#[derive(Clone)]
pub struct CertificateBundle {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

impl CertificateBundle {
    /// CA certificate in the form a webhook `caBundle` expects (PEM bytes)
    pub fn ca_bundle(&self) -> Result<ByteString, TlsError> {
        pem::parse(&self.ca_cert_pem)
            .map_err(|e| TlsError::Parse(format!("CA certificate: {}", e)))?;
        Ok(ByteString(self.ca_cert_pem.as_bytes().to_vec()))
    }
}

/// Names the service answers to inside the cluster
pub fn service_dns_names(service_name: &str, namespace: &str) -> Vec<String> {
    vec![
        service_name.to_string(),
        format!("{}.{}", service_name, namespace),
        format!("{}.{}.svc", service_name, namespace),
        format!("{}.{}.svc.cluster.local", service_name, namespace),
    ]
}

fn validity(params: &mut CertificateParams, days: i64) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(days);
}

fn generate_ca() -> Result<(Certificate, KeyPair), TlsError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "triton-webhook-ca");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "triton");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    validity(&mut params, CA_VALIDITY_DAYS);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

fn generate_server_cert(
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    service_name: &str,
    namespace: &str,
) -> Result<(String, String), TlsError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, service_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "triton");

    params.subject_alt_names = service_dns_names(service_name, namespace)
        .into_iter()
        .map(|name| {
            name.clone()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|e: rcgen::Error| TlsError::InvalidDnsName {
                    name,
                    reason: e.to_string(),
                })
        })
        .collect::<Result<_, _>>()?;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    validity(&mut params, SERVER_VALIDITY_DAYS);

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, ca_cert, ca_key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Fresh CA plus a serving certificate for `service_name.namespace.svc`
pub fn generate_certificate_bundle(
    service_name: &str,
    namespace: &str,
) -> Result<CertificateBundle, TlsError> {
    let (ca_cert, ca_key) = generate_ca()?;
    let (server_cert_pem, server_key_pem) =
        generate_server_cert(&ca_cert, &ca_key, service_name, namespace)?;

    Ok(CertificateBundle {
        ca_cert_pem: ca_cert.pem(),
        server_cert_pem,
        server_key_pem,
    })
}

pub fn bundle_to_secret(bundle: &CertificateBundle, name: &str, namespace: &str) -> Secret {
    let data = BTreeMap::from([
        (
            SECRET_CA_CERT_KEY.to_string(),
            ByteString(bundle.ca_cert_pem.as_bytes().to_vec()),
        ),
        (
            SECRET_SERVER_CERT_KEY.to_string(),
            ByteString(bundle.server_cert_pem.as_bytes().to_vec()),
        ),
        (
            SECRET_SERVER_KEY_KEY.to_string(),
            ByteString(bundle.server_key_pem.as_bytes().to_vec()),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "triton".to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Bundle stored in `secret`, or `None` when any key is missing
pub fn bundle_from_secret(secret: &Secret) -> Option<CertificateBundle> {
    let data = secret.data.as_ref()?;
    let read = |key: &str| {
        data.get(key)
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .filter(|s| !s.trim().is_empty())
    };
    Some(CertificateBundle {
        ca_cert_pem: read(SECRET_CA_CERT_KEY)?,
        server_cert_pem: read(SECRET_SERVER_CERT_KEY)?,
        server_key_pem: read(SECRET_SERVER_KEY_KEY)?,
    })
}

pub async fn load_from_secret(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> Result<Option<CertificateBundle>, TlsError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match secrets.get(secret_name).await {
        Ok(secret) => {
            let bundle = bundle_from_secret(&secret);
            if bundle.is_none() {
                warn!(secret = secret_name, "TLS Secret is incomplete, regenerating");
            }
            Ok(bundle)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create the Secret, or overwrite its data when it already exists
pub async fn save_to_secret(
    client: &Client,
    namespace: &str,
    secret_name: &str,
    bundle: &CertificateBundle,
) -> Result<(), TlsError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = bundle_to_secret(bundle, secret_name, namespace);

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            secrets
                .patch(secret_name, &PatchParams::default(), &Patch::Merge(&secret))
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Point every webhook of `config` at `ca_bundle`; true when anything changed
pub fn inject_ca_bundle(config: &mut ValidatingWebhookConfiguration, ca_bundle: &ByteString) -> bool {
    let mut changed = false;
    for webhook in config.webhooks.iter_mut().flatten() {
        if webhook.client_config.ca_bundle.as_ref() != Some(ca_bundle) {
            webhook.client_config.ca_bundle = Some(ca_bundle.clone());
            changed = true;
        }
    }
    changed
}

/// Write the CA into the named ValidatingWebhookConfiguration
///
/// Replaces with the resourceVersion that was read, so a concurrent edit
/// makes this call fail instead of being overwritten.
pub async fn patch_webhook_ca_bundle(
    client: &Client,
    config_name: &str,
    bundle: &CertificateBundle,
) -> Result<(), TlsError> {
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let mut config = api.get(config_name).await?;
    let ca_bundle = bundle.ca_bundle()?;

    if inject_ca_bundle(&mut config, &ca_bundle) {
        config.metadata.managed_fields = None;
        api.replace(config_name, &PostParams::default(), &config)
            .await?;
        info!(webhook = config_name, "Injected CA bundle");
    }
    Ok(())
}

/// Load or create the serving bundle and publish its CA
///
/// A missing ValidatingWebhookConfiguration is logged, not fatal: the
/// manifests may be applied after the controller starts.
pub async fn initialize_tls(
    client: &Client,
    service_name: &str,
    namespace: &str,
    secret_name: &str,
    webhook_config_name: &str,
) -> Result<CertificateBundle, TlsError> {
    let bundle = match load_from_secret(client, namespace, secret_name).await? {
        Some(bundle) => {
            info!(secret = secret_name, "Loaded webhook certificates from Secret");
            bundle
        }
        None => {
            let bundle = generate_certificate_bundle(service_name, namespace)?;
            save_to_secret(client, namespace, secret_name, &bundle).await?;
            info!(secret = secret_name, "Generated webhook certificates");
            bundle
        }
    };

    if let Err(e) = patch_webhook_ca_bundle(client, webhook_config_name, &bundle).await {
        warn!(
            webhook = webhook_config_name,
            error = %e,
            "Failed to inject CA bundle"
        );
    }
    Ok(bundle)
}

/// rustls server config presenting the bundle's serving certificate
pub fn build_rustls_config(
    bundle: &CertificateBundle,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    use rustls::pki_types::CertificateDer;
    use rustls_pemfile::{certs, private_key};
    use std::io::BufReader;

    let chain: Vec<CertificateDer<'static>> =
        certs(&mut BufReader::new(bundle.server_cert_pem.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Parse(format!("server certificate: {}", e)))?;
    if chain.is_empty() {
        return Err(TlsError::InvalidPem);
    }

    let key = private_key(&mut BufReader::new(bundle.server_key_pem.as_bytes()))
        .map_err(|e| TlsError::Parse(format!("private key: {}", e)))?
        .ok_or(TlsError::InvalidPem)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TlsError::Parse(format!("protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| TlsError::Parse(format!("server config: {}", e)))?;

    Ok(Arc::new(config))
}

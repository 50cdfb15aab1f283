//! Client certificate issuance through the hub's CertificateSigningRequest API
//!
//! A fresh key pair is generated for every request. The CSR subject encodes
//! the agent identity; once a hub admin (or auto-approver) approves it, the
//! signed certificate is written next to the key together with a hub
//! kubeconfig that references both files.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::config::Kubeconfig;
use kube::Client;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use spoke_common::{AGENT_NAME_LABEL, CLUSTER_NAME_LABEL, IDENTITY_PREFIX};

use crate::cert_store::HubKubeconfigDir;
use crate::error::RegistrationError;
use crate::identity::AgentIdentity;

/// Signer for client certificates accepted by the hub API server
pub const CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Group every managed cluster agent belongs to
pub const MANAGED_CLUSTERS_GROUP: &str = "managed-clusters";

/// Default interval between CSR status checks
pub const DEFAULT_CSR_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// X.520 organizationName, used for the second organization entry
const ORGANIZATION_OID: [u64; 4] = [2, 5, 4, 10];

/// A key and the certificate the hub issued for it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCredentials {
    /// PEM private key
    pub key_pem: String,
    /// PEM certificate chain
    pub cert_pem: String,
}

/// Minimal CSR API used by the issuer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CsrClient: Send + Sync {
    /// Create the CSR and return its server-assigned name
    async fn create(&self, csr: CertificateSigningRequest) -> Result<String, RegistrationError>;

    /// Fetch the current state of a CSR
    async fn get(&self, name: &str) -> Result<CertificateSigningRequest, RegistrationError>;
}

/// [`CsrClient`] backed by the hub API server
pub struct KubeCsrClient {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrClient {
    /// Use the given hub client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CsrClient for KubeCsrClient {
    async fn create(&self, csr: CertificateSigningRequest) -> Result<String, RegistrationError> {
        let created = self.api.create(&PostParams::default(), &csr).await?;
        created
            .metadata
            .name
            .ok_or_else(|| spoke_common::Error::internal_with_context("csr", "created CSR has no name").into())
    }

    async fn get(&self, name: &str) -> Result<CertificateSigningRequest, RegistrationError> {
        Ok(self.api.get(name).await?)
    }
}

/// Generate a key pair and a PEM CSR for `identity`
pub fn generate_csr(identity: &AgentIdentity) -> Result<(KeyPair, String), RegistrationError> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(identity.common_name()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(identity.cluster_group()),
    );
    // DistinguishedName keeps one value per type; the custom OID adds a second O.
    dn.push(
        DnType::CustomDnType(ORGANIZATION_OID.to_vec()),
        DnValue::Utf8String(format!("{}:{}", IDENTITY_PREFIX, MANAGED_CLUSTERS_GROUP)),
    );
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().map_err(|e| RegistrationError::KeyGeneration(e.to_string()))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| RegistrationError::KeyGeneration(format!("failed to create CSR: {}", e)))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| RegistrationError::KeyGeneration(format!("failed to encode CSR: {}", e)))?;
    Ok((key_pair, csr_pem))
}

/// Kubernetes CSR object wrapping `csr_pem`
pub fn csr_object(identity: &AgentIdentity, csr_pem: &str) -> CertificateSigningRequest {
    let labels = BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), identity.cluster_name.clone()),
        (AGENT_NAME_LABEL.to_string(), identity.agent_name.clone()),
    ]);
    CertificateSigningRequest {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", identity.cluster_name)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(csr_pem.as_bytes().to_vec()),
            signer_name: CLIENT_SIGNER.to_string(),
            usages: Some(vec![
                "digital signature".to_string(),
                "key encipherment".to_string(),
                "client auth".to_string(),
            ]),
            ..Default::default()
        },
        status: None,
    }
}

/// Outcome of one look at a submitted CSR
#[derive(Debug, PartialEq, Eq)]
pub enum CsrStatus {
    /// Not yet approved and signed
    Pending,
    /// Signed certificate (PEM)
    Issued(String),
    /// Denied or failed, with the condition type and message
    Rejected {
        /// "Denied" or "Failed"
        outcome: String,
        /// Condition message
        message: String,
    },
}

/// Classify a CSR by its status
pub fn csr_status(csr: &CertificateSigningRequest) -> CsrStatus {
    let Some(status) = &csr.status else {
        return CsrStatus::Pending;
    };
    if let Some(rejected) = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Denied" || c.type_ == "Failed")
    {
        return CsrStatus::Rejected {
            outcome: rejected.type_.clone(),
            message: rejected.message.clone().unwrap_or_default(),
        };
    }
    match &status.certificate {
        Some(cert) if !cert.0.is_empty() => {
            CsrStatus::Issued(String::from_utf8_lossy(&cert.0).into_owned())
        }
        _ => CsrStatus::Pending,
    }
}

/// Submits CSRs and waits for them to be signed
pub struct CertificateIssuer {
    client: Arc<dyn CsrClient>,
    poll_interval: Duration,
}

impl CertificateIssuer {
    /// Issuer using `client`
    pub fn new(client: Arc<dyn CsrClient>) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_CSR_POLL_INTERVAL,
        }
    }

    /// Override how often the CSR is re-read
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Request a certificate for `identity` and wait for the hub to sign it.
    ///
    /// Waits indefinitely for approval. Transient read errors are retried at
    /// the poll interval; a denied or failed CSR is returned as
    /// [`RegistrationError::CsrRejected`].
    pub async fn issue(
        &self,
        identity: &AgentIdentity,
        token: &CancellationToken,
    ) -> Result<IssuedCredentials, RegistrationError> {
        let (key_pair, csr_pem) = generate_csr(identity)?;
        let name = self.client.create(csr_object(identity, &csr_pem)).await?;
        info!(csr = %name, identity = %identity, "submitted certificate signing request");

        loop {
            match self.client.get(&name).await {
                Ok(csr) => match csr_status(&csr) {
                    CsrStatus::Issued(cert_pem) => {
                        info!(csr = %name, "certificate signing request approved");
                        return Ok(IssuedCredentials {
                            key_pem: key_pair.serialize_pem(),
                            cert_pem,
                        });
                    }
                    CsrStatus::Rejected { outcome, message } => {
                        return Err(RegistrationError::CsrRejected {
                            name,
                            outcome,
                            message,
                        })
                    }
                    CsrStatus::Pending => debug!(csr = %name, "waiting for CSR approval"),
                },
                Err(e) if e.is_retryable() => debug!(csr = %name, error = %e, "failed to read CSR"),
                Err(e) => return Err(e),
            }
            if !spoke_common::wait::sleep_or_cancel(self.poll_interval, token).await {
                return Err(RegistrationError::Cancelled);
            }
        }
    }
}

/// Render the hub kubeconfig for the credentials in `dir`.
///
/// Server and CA come from the bootstrap kubeconfig's current context; the
/// client certificate and key are referenced by absolute path so the file
/// stays valid across rotations.
pub fn render_hub_kubeconfig(
    bootstrap: &Kubeconfig,
    dir: &HubKubeconfigDir,
    cluster_name: &str,
) -> Result<String, RegistrationError> {
    let context_name = bootstrap
        .current_context
        .as_deref()
        .or_else(|| bootstrap.contexts.first().map(|c| c.name.as_str()))
        .ok_or_else(|| RegistrationError::Kubeconfig("bootstrap kubeconfig has no context".into()))?;
    let context = bootstrap
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| {
            RegistrationError::Kubeconfig(format!("context {} not found", context_name))
        })?;
    let cluster = bootstrap
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            RegistrationError::Kubeconfig(format!("cluster {} not found", context.cluster))
        })?;

    let absolute = |path: std::path::PathBuf| -> String {
        std::path::absolute(&path)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    };

    let kubeconfig = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "hub", "cluster": cluster }],
        "users": [{
            "name": "default-auth",
            "user": {
                "client-certificate": absolute(dir.cert_path()),
                "client-key": absolute(dir.key_path()),
            },
        }],
        "contexts": [{
            "name": "default-context",
            "context": {
                "cluster": "hub",
                "user": "default-auth",
                "namespace": cluster_name,
            },
        }],
        "current-context": "default-context",
    });
    serde_yaml::to_string(&kubeconfig).map_err(|e| RegistrationError::Kubeconfig(e.to_string()))
}

/// Write the key, certificate and kubeconfig into `dir`.
///
/// Each file is written to a temporary sibling and renamed into place. The
/// kubeconfig goes last, so its presence implies the pair is complete.
pub fn write_credentials(
    dir: &HubKubeconfigDir,
    credentials: &IssuedCredentials,
    kubeconfig: &str,
) -> Result<(), RegistrationError> {
    std::fs::create_dir_all(dir.path()).map_err(|source| RegistrationError::Io {
        action: "create",
        path: dir.path().to_path_buf(),
        source,
    })?;
    write_atomic(&dir.key_path(), credentials.key_pem.as_bytes())?;
    write_atomic(&dir.cert_path(), credentials.cert_pem.as_bytes())?;
    write_atomic(&dir.kubeconfig_path(), kubeconfig.as_bytes())?;
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RegistrationError> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).map_err(io_error("write", &tmp))?;
    file.write_all(data).map_err(io_error("write", &tmp))?;
    file.sync_all().map_err(io_error("sync", &tmp))?;
    std::fs::rename(&tmp, path).map_err(io_error("rename", path))?;
    Ok(())
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> RegistrationError {
    let path = path.to_path_buf();
    move |source| RegistrationError::Io {
        action,
        path,
        source,
    }
}

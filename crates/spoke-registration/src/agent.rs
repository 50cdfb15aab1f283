//! Registration sub-process
//!
//! Runs beside the work agent for the whole process lifetime:
//!
//! 1. While the hub kubeconfig is not valid for our identity, register the
//!    ManagedCluster and request a client certificate with the bootstrap
//!    kubeconfig.
//! 2. Once valid, re-issue the certificate with the hub kubeconfig after 80%
//!    of its lifetime.
//! 3. Renew the cluster lease every lease interval.
//!
//! Transient API errors are retried with capped backoff. A rejected CSR or an
//! unusable bootstrap kubeconfig ends the sub-process with an error, which the
//! agent treats as fatal.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::config::Kubeconfig;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spoke_common::kube_utils::{create_client, RateLimit};
use spoke_common::wait::{sleep_or_cancel, Backoff};

use crate::cert_store::{CertificateLifetime, CertificateStore, HubKubeconfigDir};
use crate::csr::{
    render_hub_kubeconfig, write_credentials, CertificateIssuer, CsrClient, KubeCsrClient,
    DEFAULT_CSR_POLL_INTERVAL,
};
use crate::error::RegistrationError;
use crate::hub_cluster::{managed_cluster, HubClusterClient, KubeHubClusterClient};
use crate::identity::AgentIdentity;

/// Default lease renewal interval
pub const DEFAULT_LEASE_INTERVAL: Duration = Duration::from_secs(60);

/// Length of generated agent names
const AGENT_NAME_LENGTH: usize = 5;

/// Builds hub clients from a kubeconfig path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    /// CSR API reachable with `kubeconfig`
    async fn csr_client(&self, kubeconfig: &Path) -> Result<Arc<dyn CsrClient>, RegistrationError>;

    /// Cluster registration API reachable with `kubeconfig`
    async fn cluster_client(
        &self,
        kubeconfig: &Path,
    ) -> Result<Arc<dyn HubClusterClient>, RegistrationError>;
}

/// [`RegistrationBackend`] creating real, rate limited kube clients
pub struct KubeRegistrationBackend {
    rate: RateLimit,
}

impl KubeRegistrationBackend {
    /// Backend throttled to `rate`
    pub fn new(rate: RateLimit) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl RegistrationBackend for KubeRegistrationBackend {
    async fn csr_client(&self, kubeconfig: &Path) -> Result<Arc<dyn CsrClient>, RegistrationError> {
        let client = create_client(Some(kubeconfig), self.rate).await?;
        Ok(Arc::new(KubeCsrClient::new(client)))
    }

    async fn cluster_client(
        &self,
        kubeconfig: &Path,
    ) -> Result<Arc<dyn HubClusterClient>, RegistrationError> {
        let client = create_client(Some(kubeconfig), self.rate).await?;
        Ok(Arc::new(KubeHubClusterClient::new(client)))
    }
}

/// Settings of the registration sub-process
#[derive(Clone, Debug)]
pub struct RegistrationConfig {
    /// Identity to register as
    pub identity: AgentIdentity,
    /// Where the hub credentials live
    pub dir: HubKubeconfigDir,
    /// Kubeconfig with permission to create CSRs and ManagedClusters
    pub bootstrap_kubeconfig: PathBuf,
    /// Spoke API server URL advertised to the hub
    pub spoke_server: Option<String>,
    /// How often to renew the lease and re-check the certificate
    pub lease_interval: Duration,
    /// How often to re-read a pending CSR
    pub csr_poll_interval: Duration,
}

impl RegistrationConfig {
    /// Config with default intervals
    pub fn new(identity: AgentIdentity, dir: HubKubeconfigDir, bootstrap_kubeconfig: PathBuf) -> Self {
        Self {
            identity,
            dir,
            bootstrap_kubeconfig,
            spoke_server: None,
            lease_interval: DEFAULT_LEASE_INTERVAL,
            csr_poll_interval: DEFAULT_CSR_POLL_INTERVAL,
        }
    }
}

/// Drives credential issuance and hub-side registration
pub struct RegistrationAgent {
    config: RegistrationConfig,
    store: CertificateStore,
    backend: Arc<dyn RegistrationBackend>,
    registered: AtomicBool,
}

impl RegistrationAgent {
    /// Agent using `backend` to reach the hub
    pub fn new(config: RegistrationConfig, backend: Arc<dyn RegistrationBackend>) -> Self {
        let store = CertificateStore::new(config.dir.clone());
        Self {
            config,
            store,
            backend,
            registered: AtomicBool::new(false),
        }
    }

    /// Run until cancelled or until a non-retryable error occurs
    pub async fn run(&self, token: CancellationToken) -> Result<(), RegistrationError> {
        info!(identity = %self.config.identity, "starting registration agent");
        let mut backoff = Backoff::new(Duration::from_secs(1), self.config.lease_interval);

        loop {
            let delay = match self.sync(&token).await {
                Ok(()) => {
                    backoff.reset();
                    self.config.lease_interval
                }
                Err(RegistrationError::Cancelled) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "registration sync failed");
                    delay
                }
                Err(e) => return Err(e),
            };
            if !sleep_or_cancel(delay, &token).await {
                info!("registration agent stopped");
                return Ok(());
            }
        }
    }

    /// One pass: (re-)issue credentials if needed, then renew the lease
    pub async fn sync(&self, token: &CancellationToken) -> Result<(), RegistrationError> {
        let identity = &self.config.identity;
        let state = self.store.check(identity);

        if !state.is_valid() {
            info!(state = %state, "hub kubeconfig not usable, bootstrapping");
            let bootstrap = self.config.bootstrap_kubeconfig.clone();
            let cluster = self.backend.cluster_client(&bootstrap).await?;
            self.ensure_registered(cluster.as_ref()).await?;
            self.issue(&bootstrap, token).await?;
        } else if self.rotation_due() {
            info!("client certificate past rotation threshold, renewing");
            self.issue(&self.config.dir.kubeconfig_path(), token).await?;
        }

        let hub = self
            .backend
            .cluster_client(&self.config.dir.kubeconfig_path())
            .await?;
        self.ensure_registered(hub.as_ref()).await?;
        hub.renew_lease(&identity.cluster_name, Utc::now()).await
    }

    async fn ensure_registered(&self, client: &dyn HubClusterClient) -> Result<(), RegistrationError> {
        if self.registered.load(Ordering::Acquire) {
            return Ok(());
        }
        let desired = managed_cluster(
            &self.config.identity.cluster_name,
            self.config.spoke_server.as_deref(),
        );
        client.ensure_managed_cluster(desired).await?;
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    async fn issue(&self, source: &Path, token: &CancellationToken) -> Result<(), RegistrationError> {
        // Server and CA for the new hub kubeconfig come from the kubeconfig in use.
        let template = Kubeconfig::read_from(source)
            .map_err(|e| RegistrationError::Kubeconfig(format!("{}: {}", source.display(), e)))?;
        let kubeconfig = render_hub_kubeconfig(
            &template,
            &self.config.dir,
            &self.config.identity.cluster_name,
        )?;

        let csr = self.backend.csr_client(source).await?;
        let credentials = CertificateIssuer::new(csr)
            .with_poll_interval(self.config.csr_poll_interval)
            .issue(&self.config.identity, token)
            .await?;
        write_credentials(&self.config.dir, &credentials, &kubeconfig)?;
        info!(dir = %self.config.dir.path().display(), "hub credentials written");
        Ok(())
    }

    fn rotation_due(&self) -> bool {
        std::fs::read(self.config.dir.cert_path())
            .ok()
            .and_then(|pem| CertificateLifetime::from_pem(&pem).ok())
            .map_or(true, |lifetime| lifetime.needs_rotation(Utc::now()))
    }
}

/// Resolve the agent name.
///
/// An explicit name wins. Otherwise the name persisted in the hub kubeconfig
/// directory is reused, or a new random one is generated and persisted so the
/// agent keeps its identity across restarts.
pub fn resolve_agent_name(
    dir: &HubKubeconfigDir,
    explicit: Option<&str>,
) -> Result<String, RegistrationError> {
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let path = dir.agent_name_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let name: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| char::from(b).to_ascii_lowercase())
        .take(AGENT_NAME_LENGTH)
        .collect();
    std::fs::create_dir_all(dir.path()).map_err(|source| RegistrationError::Io {
        action: "create",
        path: dir.path().to_path_buf(),
        source,
    })?;
    std::fs::write(&path, &name).map_err(|source| RegistrationError::Io {
        action: "write",
        path: path.clone(),
        source,
    })?;
    info!(agent = %name, "generated agent name");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_store::test_support::{cert_pem, write_files};
    use crate::csr::MockCsrClient;
    use crate::hub_cluster::MockHubClusterClient;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequest, CertificateSigningRequestCondition,
        CertificateSigningRequestStatus,
    };
    use k8s_openapi::ByteString;

    const BOOTSTRAP: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: hub
  cluster:
    server: https://hub.example.com:6443
contexts:
- name: bootstrap
  context:
    cluster: hub
    user: bootstrap
current-context: bootstrap
users:
- name: bootstrap
  user:
    token: abc
"#;

    fn identity() -> AgentIdentity {
        AgentIdentity::new("cluster-a", "agent-1")
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: RegistrationConfig,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let bootstrap = tmp.path().join("bootstrap-kubeconfig");
        std::fs::write(&bootstrap, BOOTSTRAP).unwrap();
        let dir = HubKubeconfigDir::new(tmp.path().join("hub"));
        std::fs::create_dir_all(dir.path()).unwrap();
        let mut config = RegistrationConfig::new(identity(), dir, bootstrap);
        config.csr_poll_interval = Duration::from_millis(10);
        Fixture { _tmp: tmp, config }
    }

    fn signed_csr(cert: &str) -> CertificateSigningRequest {
        CertificateSigningRequest {
            status: Some(CertificateSigningRequestStatus {
                certificate: Some(ByteString(cert.as_bytes().to_vec())),
                conditions: None,
            }),
            ..Default::default()
        }
    }

    fn accepting_cluster_client() -> MockHubClusterClient {
        let mut client = MockHubClusterClient::new();
        client
            .expect_ensure_managed_cluster()
            .returning(|_| Ok(true));
        client.expect_renew_lease().returning(|_, _| Ok(()));
        client
    }

    #[tokio::test]
    async fn valid_credentials_only_renew_the_lease() {
        let f = fixture();
        write_files(&f.config.dir, true, true, Some(&cert_pem(&identity().common_name())));

        let hub_path = f.config.dir.kubeconfig_path();
        let mut backend = MockRegistrationBackend::new();
        backend.expect_csr_client().never();
        backend
            .expect_cluster_client()
            .withf(move |p| p == hub_path)
            .returning(|_| {
                let mut client = MockHubClusterClient::new();
                client
                    .expect_ensure_managed_cluster()
                    .returning(|_| Ok(false));
                client
                    .expect_renew_lease()
                    .withf(|cluster, _| cluster == "cluster-a")
                    .times(1)
                    .returning(|_, _| Ok(()));
                Ok(Arc::new(client))
            });

        let agent = RegistrationAgent::new(f.config.clone(), Arc::new(backend));
        agent.sync(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_are_bootstrapped() {
        let f = fixture();
        let bootstrap_path = f.config.bootstrap_kubeconfig.clone();
        let issued = cert_pem(&identity().common_name());

        let mut backend = MockRegistrationBackend::new();
        let expected = bootstrap_path.clone();
        backend
            .expect_csr_client()
            .withf(move |p| p == expected)
            .times(1)
            .returning(move |_| {
                let mut csr = MockCsrClient::new();
                csr.expect_create()
                    .returning(|_| Ok("cluster-a-xyz".to_string()));
                let cert = issued.clone();
                csr.expect_get().returning(move |_| Ok(signed_csr(&cert)));
                Ok(Arc::new(csr))
            });
        backend
            .expect_cluster_client()
            .returning(|_| Ok(Arc::new(accepting_cluster_client())));

        let agent = RegistrationAgent::new(f.config.clone(), Arc::new(backend));
        agent.sync(&CancellationToken::new()).await.unwrap();

        assert!(agent.store.check(&identity()).is_valid());
        let kubeconfig = std::fs::read_to_string(f.config.dir.kubeconfig_path()).unwrap();
        assert!(kubeconfig.contains("https://hub.example.com:6443"));
        assert!(!kubeconfig.contains("token"));
    }

    #[tokio::test]
    async fn denied_csr_ends_the_sub_process() {
        let f = fixture();
        let mut backend = MockRegistrationBackend::new();
        backend.expect_csr_client().returning(|_| {
            let mut csr = MockCsrClient::new();
            csr.expect_create()
                .returning(|_| Ok("cluster-a-xyz".to_string()));
            csr.expect_get().returning(|_| {
                Ok(CertificateSigningRequest {
                    status: Some(CertificateSigningRequestStatus {
                        certificate: None,
                        conditions: Some(vec![CertificateSigningRequestCondition {
                            type_: "Denied".to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                })
            });
            Ok(Arc::new(csr))
        });
        backend
            .expect_cluster_client()
            .returning(|_| Ok(Arc::new(accepting_cluster_client())));

        let agent = RegistrationAgent::new(f.config.clone(), Arc::new(backend));
        let err = agent.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::CsrRejected { .. }));
    }

    #[tokio::test]
    async fn cancelled_run_exits_cleanly() {
        let f = fixture();
        write_files(&f.config.dir, true, true, Some(&cert_pem(&identity().common_name())));
        let mut backend = MockRegistrationBackend::new();
        backend
            .expect_cluster_client()
            .returning(|_| Ok(Arc::new(accepting_cluster_client())));

        let token = CancellationToken::new();
        token.cancel();
        let agent = RegistrationAgent::new(f.config.clone(), Arc::new(backend));
        agent.run(token).await.unwrap();
    }

    mod agent_name {
        use super::*;

        #[test]
        fn explicit_name_wins() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = HubKubeconfigDir::new(tmp.path());
            assert_eq!(resolve_agent_name(&dir, Some("agent-1")).unwrap(), "agent-1");
            assert!(!dir.agent_name_path().exists());
        }

        #[test]
        fn generated_name_is_persisted_and_reused() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = HubKubeconfigDir::new(tmp.path().join("hub"));

            let first = resolve_agent_name(&dir, None).unwrap();
            assert_eq!(first.len(), AGENT_NAME_LENGTH);
            assert!(first.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

            let second = resolve_agent_name(&dir, Some("")).unwrap();
            assert_eq!(first, second);
        }
    }
}

//! Agent orchestrator
//!
//! Startup is strictly ordered:
//! 1. provision the spoke CRDs (fatal on failure)
//! 2. spawn the registration sub-process as a supervised task; it runs
//!    alongside everything below and its failure cancels the agent
//! 3. block until the hub client certificate is trusted
//! 4. build hub and spoke clients, caches and controllers
//! 5. run them until the shared token is cancelled, rebuilding them whenever
//!    the hub client certificate is rotated
//!
//! Each stage sits behind a trait so the ordering can be tested without a
//! cluster.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spoke_common::kube_utils::create_client;
use spoke_registration::{
    resolve_agent_name, AgentIdentity, CertificateStore, CredentialSnapshot, CredentialWatcher,
    HubConnection, HubTrustBootstrapper, KubeRegistrationBackend, RegistrationAgent,
    RegistrationConfig, RegistrationError, TrustError,
};
use spoke_work::{WorkAgent, WorkAgentConfig};

use crate::options::AgentOptions;
use crate::startup::{CrdProvisioner, SchemaRegistry, Supervisor};

/// A built work agent, running once polled
pub type RunningAgent = Pin<Box<dyn Future<Output = spoke_common::Result<()>> + Send>>;

/// Fatal startup failures, one variant per stage
#[derive(Debug, Error)]
pub enum StartupError {
    /// The flags or persisted state are unusable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The spoke client could not be built
    #[error("spoke client construction failed: {0}")]
    SpokeClient(#[source] spoke_common::Error),

    /// CRDs could not be provisioned on the spoke
    #[error("schema provisioning failed: {0}")]
    SchemaProvisioning(#[source] spoke_common::Error),

    /// Clients, caches or controllers could not be built
    #[error("work agent startup failed: {0}")]
    WorkAgent(#[source] spoke_common::Error),

    /// A supervised task failed and took the agent down
    #[error("{task} failed: {message}")]
    TaskFailed {
        /// Name of the failed task
        task: &'static str,
        /// Rendered error of the task
        message: String,
    },
}

impl StartupError {
    /// Stage that failed, for the fatal log line
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::SpokeClient(_) => "spoke-client",
            Self::SchemaProvisioning(_) => "schema-provisioning",
            Self::WorkAgent(_) => "work-agent",
            Self::TaskFailed { task, .. } => *task,
        }
    }
}

/// Stage 1: install the spoke CRDs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaProvisioner: Send + Sync {
    /// Create or update every CRD
    async fn provision(&self) -> spoke_common::Result<()>;
}

/// Stage 2: the registration sub-process
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationTask: Send + Sync {
    /// Run until `token` is cancelled or a fatal error occurs
    async fn run(&self, token: CancellationToken) -> Result<(), RegistrationError>;
}

/// Stage 3: wait for a trusted hub certificate
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrustGate: Send + Sync {
    /// Block until trusted or cancelled
    async fn wait(&self, token: &CancellationToken) -> Result<HubConnection, TrustError>;
}

/// Stages 4 and 5: build and start the work controllers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkLauncher: Send + Sync {
    /// Build everything for `hub`; the returned future runs it
    async fn start(
        &self,
        hub: HubConnection,
        token: CancellationToken,
    ) -> spoke_common::Result<RunningAgent>;
}

/// Stage 5: notice a rotated hub client certificate
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RotationWatch: Send + Sync {
    /// Certificate the next work agent will be built with
    fn snapshot(&self) -> CredentialSnapshot;

    /// Wait for a trusted certificate other than `since`; `false` once
    /// `token` is cancelled
    async fn wait_for_rotation(
        &self,
        since: &CredentialSnapshot,
        token: &CancellationToken,
    ) -> bool;
}

#[async_trait]
impl SchemaProvisioner for CrdProvisioner {
    async fn provision(&self) -> spoke_common::Result<()> {
        self.install().await
    }
}

#[async_trait]
impl RegistrationTask for RegistrationAgent {
    async fn run(&self, token: CancellationToken) -> Result<(), RegistrationError> {
        RegistrationAgent::run(self, token).await
    }
}

#[async_trait]
impl TrustGate for HubTrustBootstrapper {
    async fn wait(&self, token: &CancellationToken) -> Result<HubConnection, TrustError> {
        self.wait_for_trust(token).await
    }
}

#[async_trait]
impl RotationWatch for CredentialWatcher {
    fn snapshot(&self) -> CredentialSnapshot {
        CredentialWatcher::snapshot(self)
    }

    async fn wait_for_rotation(
        &self,
        since: &CredentialSnapshot,
        token: &CancellationToken,
    ) -> bool {
        CredentialWatcher::wait_for_rotation(self, since, token).await
    }
}

/// [`WorkLauncher`] building a [`WorkAgent`]
pub struct WorkAgentLauncher {
    config: WorkAgentConfig,
}

impl WorkAgentLauncher {
    /// Launcher for the given controller settings
    pub fn new(config: WorkAgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkLauncher for WorkAgentLauncher {
    async fn start(
        &self,
        hub: HubConnection,
        token: CancellationToken,
    ) -> spoke_common::Result<RunningAgent> {
        let mut config = self.config.clone();
        config.hub_kubeconfig = hub.kubeconfig_path;
        let agent = WorkAgent::build(&config, &token).await?;
        Ok(Box::pin(agent.run(token)))
    }
}

/// Runs the startup stages in order
pub struct Orchestrator {
    schema: Arc<dyn SchemaProvisioner>,
    registration: Arc<dyn RegistrationTask>,
    trust: Arc<dyn TrustGate>,
    work: Arc<dyn WorkLauncher>,
    rotation: Option<Arc<dyn RotationWatch>>,
}

impl Orchestrator {
    /// Orchestrator over the given stages
    pub fn new(
        schema: Arc<dyn SchemaProvisioner>,
        registration: Arc<dyn RegistrationTask>,
        trust: Arc<dyn TrustGate>,
        work: Arc<dyn WorkLauncher>,
    ) -> Self {
        Self {
            schema,
            registration,
            trust,
            work,
            rotation: None,
        }
    }

    /// Rebuild the work agent whenever `rotation` reports a new certificate
    pub fn with_rotation(mut self, rotation: Arc<dyn RotationWatch>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Run every stage, then block until `token` is cancelled.
    ///
    /// Cancellation before trust is a clean exit unless a supervised task
    /// failed. Controllers are not joined on the way out. A rotated hub
    /// certificate stops the running work agent and builds a new one, so
    /// the hub clients present the new certificate.
    pub async fn run(&self, token: CancellationToken) -> Result<(), StartupError> {
        self.schema
            .provision()
            .await
            .map_err(StartupError::SchemaProvisioning)?;
        info!("CRDs provisioned");

        let supervisor = Supervisor::new(token.clone());
        let registration = self.registration.clone();
        let registration_token = token.clone();
        supervisor.spawn_fatal("registration", async move {
            registration.run(registration_token).await
        });

        let hub = match self.trust.wait(&token).await {
            Ok(hub) => hub,
            Err(e) => {
                return match fatal(&supervisor) {
                    Some(failure) => Err(failure),
                    None => {
                        info!(reason = %e, "stopped before hub trust was established");
                        Ok(())
                    }
                };
            }
        };
        info!(identity = %hub.identity, "hub trust established");

        loop {
            let since = self.rotation.as_ref().map(|r| r.snapshot());
            let generation = token.child_token();
            let running = self
                .work
                .start(hub.clone(), generation.clone())
                .await
                .map_err(StartupError::WorkAgent)?;
            let handle = supervisor.spawn_fatal("work-agent", running);

            let rotated = match (&self.rotation, &since) {
                (Some(rotation), Some(since)) => rotation.wait_for_rotation(since, &token).await,
                _ => {
                    token.cancelled().await;
                    false
                }
            };
            if !rotated {
                break;
            }

            info!("restarting work agent with the rotated hub certificate");
            generation.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "work agent task did not stop cleanly");
            }
        }
        info!("shutting down");
        match fatal(&supervisor) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

fn fatal(supervisor: &Supervisor) -> Option<StartupError> {
    supervisor.failure().map(|f| StartupError::TaskFailed {
        task: f.task,
        message: f.message,
    })
}

/// Wire the production stages from `options` and run them
pub async fn run_agent(
    options: AgentOptions,
    registry: SchemaRegistry,
    token: CancellationToken,
) -> Result<(), StartupError> {
    let rate = options.rate_limit();
    let dir = options.hub_dir();
    let agent_name = resolve_agent_name(&dir, options.agent_name.as_deref())
        .map_err(|e| StartupError::Config(e.to_string()))?;
    let identity = AgentIdentity::new(&options.cluster_name, &agent_name);
    info!(identity = %identity, "starting work agent");

    let spoke_client = create_client(options.spoke_kubeconfig.as_deref(), rate)
        .await
        .map_err(StartupError::SpokeClient)?;
    let schema = CrdProvisioner::new(spoke_client, registry);

    let mut registration =
        RegistrationConfig::new(identity.clone(), dir.clone(), options.bootstrap_kubeconfig.clone());
    registration.spoke_server = options.spoke_external_server_url.clone();
    let registration = RegistrationAgent::new(
        registration,
        Arc::new(KubeRegistrationBackend::new(rate)),
    );

    let store = Arc::new(CertificateStore::new(dir.clone()));
    let trust = HubTrustBootstrapper::new(store.clone(), dir.clone(), identity.clone())
        .with_interval(options.hub_trust_poll_interval);
    let rotation = CredentialWatcher::new(store, dir, identity);

    let work = WorkAgentLauncher::new(options.work_config(&agent_name));

    let result = Orchestrator::new(
        Arc::new(schema),
        Arc::new(registration),
        Arc::new(trust),
        Arc::new(work),
    )
    .with_rotation(Arc::new(rotation))
    .run(token)
    .await;
    if let Err(e) = &result {
        error!(stage = e.stage(), error = %e, "work agent failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use mockall::Sequence;
    use std::path::PathBuf;
    use std::time::Duration;

    fn connection() -> HubConnection {
        HubConnection {
            kubeconfig_path: PathBuf::from("/spoke/hub-kubeconfig/kubeconfig"),
            identity: AgentIdentity::new("cluster-a", "agent-1"),
        }
    }

    /// Trust gate that only returns once the token is cancelled
    struct NeverTrusted;

    #[async_trait]
    impl TrustGate for NeverTrusted {
        async fn wait(&self, token: &CancellationToken) -> Result<HubConnection, TrustError> {
            token.cancelled().await;
            Err(TrustError::Cancelled {
                last_state: "no kubeconfig".to_string(),
            })
        }
    }

    /// Rotation watch that only returns once the token is cancelled
    struct NeverRotated;

    #[async_trait]
    impl RotationWatch for NeverRotated {
        fn snapshot(&self) -> CredentialSnapshot {
            CredentialSnapshot::default()
        }

        async fn wait_for_rotation(
            &self,
            _since: &CredentialSnapshot,
            token: &CancellationToken,
        ) -> bool {
            token.cancelled().await;
            false
        }
    }

    fn idle_registration() -> MockRegistrationTask {
        let mut registration = MockRegistrationTask::new();
        registration.expect_run().returning(|_| Ok(()));
        registration
    }

    #[tokio::test]
    async fn schema_failure_is_fatal_and_stops_startup() {
        let mut schema = MockSchemaProvisioner::new();
        schema
            .expect_provision()
            .times(1)
            .returning(|| Err(spoke_common::Error::apply("appliedmanifestworks", "forbidden")));
        let mut registration = MockRegistrationTask::new();
        registration.expect_run().never();
        let mut trust = MockTrustGate::new();
        trust.expect_wait().never();
        let mut work = MockWorkLauncher::new();
        work.expect_start().never();

        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(registration),
            Arc::new(trust),
            Arc::new(work),
        );
        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, StartupError::SchemaProvisioning(_)));
        assert_eq!(err.stage(), "schema-provisioning");
    }

    #[tokio::test]
    async fn stages_run_in_order_until_cancelled() {
        let mut seq = Sequence::new();
        let mut schema = MockSchemaProvisioner::new();
        schema
            .expect_provision()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let mut trust = MockTrustGate::new();
        trust
            .expect_wait()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(connection()));
        let mut work = MockWorkLauncher::new();
        work.expect_start()
            .withf(|hub, _| hub.identity == AgentIdentity::new("cluster-a", "agent-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, token| {
                Ok(Box::pin(async move {
                    token.cancelled().await;
                    Ok::<(), spoke_common::Error>(())
                }))
            });

        let token = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(trust),
            Arc::new(work),
        );
        let run = tokio::spawn({
            let token = token.clone();
            async move { orchestrator.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!run.is_finished());
        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_before_trust_is_clean() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut work = MockWorkLauncher::new();
        work.expect_start().never();

        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(NeverTrusted),
            Arc::new(work),
        );
        orchestrator.run(token).await.unwrap();
    }

    #[tokio::test]
    async fn registration_failure_takes_the_agent_down() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut registration = MockRegistrationTask::new();
        registration.expect_run().returning(|_| {
            Err(RegistrationError::CsrRejected {
                name: "cluster-a-x7k2p".to_string(),
                outcome: "Denied".to_string(),
                message: "not allowed".to_string(),
            })
        });
        let mut work = MockWorkLauncher::new();
        work.expect_start().never();

        let token = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(registration),
            Arc::new(NeverTrusted),
            Arc::new(work),
        );
        let err = orchestrator.run(token.clone()).await.unwrap_err();

        assert!(token.is_cancelled());
        assert_eq!(err.stage(), "registration");
        assert!(err.to_string().contains("Denied"));
    }

    #[tokio::test]
    async fn work_agent_build_failure_is_fatal() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut trust = MockTrustGate::new();
        trust.expect_wait().returning(|_| Ok(connection()));
        let mut work = MockWorkLauncher::new();
        work.expect_start()
            .returning(|_, _| Err(spoke_common::Error::internal("bad hub kubeconfig")));

        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(trust),
            Arc::new(work),
        );
        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.stage(), "work-agent");
    }

    #[tokio::test]
    async fn work_agent_failure_after_start_is_reported() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut trust = MockTrustGate::new();
        trust.expect_wait().returning(|_| Ok(connection()));
        let mut work = MockWorkLauncher::new();
        work.expect_start().returning(|_, _| {
            Ok(Box::pin(async {
                Err::<(), _>(spoke_common::Error::internal_with_context(
                    "manifestworks",
                    "cache writer dropped before sync",
                ))
            }))
        });

        let orchestrator = Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(trust),
            Arc::new(work),
        );
        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.stage(), "work-agent");
        assert!(matches!(err, StartupError::TaskFailed { .. }));
    }

    #[tokio::test]
    async fn rotated_certificate_rebuilds_the_work_agent() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut trust = MockTrustGate::new();
        trust.expect_wait().times(1).returning(|_| Ok(connection()));
        let token = CancellationToken::new();

        let mut seq = Sequence::new();
        let mut rotation = MockRotationWatch::new();
        rotation
            .expect_snapshot()
            .times(2)
            .returning(CredentialSnapshot::default);
        rotation
            .expect_wait_for_rotation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| true);
        let stop = token.clone();
        rotation
            .expect_wait_for_rotation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| {
                stop.cancel();
                false
            });

        let generations = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let started = generations.clone();
        let mut work = MockWorkLauncher::new();
        work.expect_start().times(2).returning(move |_, generation| {
            started.lock().push(generation.clone());
            Ok(Box::pin(async move {
                generation.cancelled().await;
                Ok::<(), spoke_common::Error>(())
            }))
        });

        Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(trust),
            Arc::new(work),
        )
        .with_rotation(Arc::new(rotation))
        .run(token)
        .await
        .unwrap();

        let generations = generations.lock();
        assert_eq!(generations.len(), 2);
        assert!(generations[0].is_cancelled(), "old clients must be stopped");
    }

    #[tokio::test]
    async fn work_agent_failure_ends_the_rotation_watch() {
        let mut schema = MockSchemaProvisioner::new();
        schema.expect_provision().returning(|| Ok(()));
        let mut trust = MockTrustGate::new();
        trust.expect_wait().returning(|_| Ok(connection()));
        let mut work = MockWorkLauncher::new();
        work.expect_start().times(1).returning(|_, _| {
            Ok(Box::pin(async {
                Err::<(), _>(spoke_common::Error::internal("hub watch forbidden"))
            }))
        });

        let err = Orchestrator::new(
            Arc::new(schema),
            Arc::new(idle_registration()),
            Arc::new(trust),
            Arc::new(work),
        )
        .with_rotation(Arc::new(NeverRotated))
        .run(CancellationToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.stage(), "work-agent");
    }

    #[tokio::test]
    async fn spoke_client_failure_names_its_stage() {
        let options = match crate::options::Cli::try_parse_from([
            "spoke-agent",
            "agent",
            "--cluster-name",
            "cluster-a",
            "--agent-name",
            "agent-1",
            "--hub-kubeconfig-dir",
            "/nonexistent/hub-kubeconfig",
            "--spoke-kubeconfig",
            "/nonexistent/spoke.kubeconfig",
        ])
        .unwrap()
        .command
        {
            crate::options::Commands::Agent(options) => options,
            other => panic!("unexpected command {:?}", other),
        };

        let err = run_agent(options, SchemaRegistry::spoke(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::SpokeClient(_)));
        assert_eq!(err.stage(), "spoke-client");
    }
}

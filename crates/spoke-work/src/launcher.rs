//! Work agent launcher
//!
//! Wires clients, caches and controllers together once hub trust has been
//! established. Hub caches are scoped to the managed cluster's namespace;
//! spoke caches are cluster-wide.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spoke_common::crd::{AppliedManifestWork, ManifestWork};
use spoke_common::kube_utils::{client_with_rate_limit, hub_hash, load_config, RateLimit};
use spoke_common::Result;

use crate::cache::{wait_for_sync, SharedCache};
use crate::context::{AgentContext, DEFAULT_EVICTION_GRACE_PERIOD, DEFAULT_STATUS_SYNC_INTERVAL};
use crate::runner::{build_work_controllers, NamedTask, DEFAULT_WORKERS};
use crate::validator::SubjectAccessReviewValidator;

/// Settings for the work controllers
#[derive(Clone, Debug)]
pub struct WorkAgentConfig {
    /// Managed cluster name
    pub cluster_name: String,
    /// Agent name, used as the event reporter instance
    pub agent_name: String,
    /// Hub kubeconfig produced by registration
    pub hub_kubeconfig: PathBuf,
    /// Spoke kubeconfig, in-cluster config when `None`
    pub spoke_kubeconfig: Option<PathBuf>,
    /// Overrides the agent ID recorded on AppliedManifestWorks
    pub agent_id: Option<String>,
    /// Client throttling for both clusters
    pub rate: RateLimit,
    /// Availability re-check interval
    pub status_sync_interval: Duration,
    /// Grace period before orphaned AppliedManifestWorks are evicted
    pub eviction_grace_period: Duration,
    /// Concurrent reconciles per controller
    pub workers: u16,
}

impl WorkAgentConfig {
    /// Config with default intervals and a single worker
    pub fn new(
        cluster_name: impl Into<String>,
        agent_name: impl Into<String>,
        hub_kubeconfig: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            agent_name: agent_name.into(),
            hub_kubeconfig: hub_kubeconfig.into(),
            spoke_kubeconfig: None,
            agent_id: None,
            rate: RateLimit::default(),
            status_sync_interval: DEFAULT_STATUS_SYNC_INTERVAL,
            eviction_grace_period: DEFAULT_EVICTION_GRACE_PERIOD,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Fully wired work agent, ready to start
pub struct WorkAgent {
    ctx: Arc<AgentContext>,
    works: SharedCache<ManifestWork>,
    applied_works: SharedCache<AppliedManifestWork>,
    controllers: Vec<NamedTask>,
}

impl WorkAgent {
    /// Build clients, caches and controllers.
    ///
    /// Nothing talks to either cluster until [`WorkAgent::run`].
    pub async fn build(config: &WorkAgentConfig, token: &CancellationToken) -> Result<Self> {
        let hub_config = load_config(Some(&config.hub_kubeconfig)).await?;
        let hub_hash = hub_hash(&hub_server(&hub_config));
        let hub_client = client_with_rate_limit(hub_config, config.rate)?;
        let spoke_client =
            client_with_rate_limit(load_config(config.spoke_kubeconfig.as_deref()).await?, config.rate)?;
        info!(cluster = %config.cluster_name, hub_hash = %hub_hash, "building work agent");

        let works = SharedCache::new(
            "manifestworks",
            Api::<ManifestWork>::namespaced(hub_client.clone(), &config.cluster_name),
        );
        let applied_works = SharedCache::new(
            "appliedmanifestworks",
            Api::<AppliedManifestWork>::all(spoke_client.clone()),
        );

        let ctx = Arc::new(context(config, hub_client, spoke_client, hub_hash, &works, &applied_works)?);
        let controllers = build_work_controllers(
            ctx.clone(),
            &works,
            &applied_works,
            config.workers.max(1),
            token,
        )?;

        Ok(Self {
            ctx,
            works,
            applied_works,
            controllers,
        })
    }

    /// Context shared by the controllers
    pub fn context(&self) -> Arc<AgentContext> {
        self.ctx.clone()
    }

    /// Start the caches, wait for their initial sync, then run every
    /// controller until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let works_store = self.works.store();
        let applied_store = self.applied_works.store();
        let caches = [
            tokio::spawn(self.works.into_task(token.clone())),
            tokio::spawn(self.applied_works.into_task(token.clone())),
        ];

        let synced = async {
            wait_for_sync("manifestworks", &works_store).await?;
            wait_for_sync("appliedmanifestworks", &applied_store).await
        };
        start_when_synced(synced, self.controllers, &token).await?;

        for cache in caches {
            if let Err(e) = cache.await {
                warn!(error = %e, "cache task failed");
            }
        }
        Ok(())
    }
}

/// Run `controllers` once `synced` resolves.
///
/// No controller is polled if `token` is cancelled first.
async fn start_when_synced<S>(
    synced: S,
    controllers: Vec<NamedTask>,
    token: &CancellationToken,
) -> Result<()>
where
    S: Future<Output = Result<()>>,
{
    tokio::select! {
        result = synced => result?,
        _ = token.cancelled() => {
            info!("cancelled before caches synced");
            return Ok(());
        }
    }

    info!(controllers = controllers.len(), "starting work controllers");
    join_all(controllers.into_iter().map(|(name, task)| async move {
        task.await;
        info!(controller = name, "controller stopped");
    }))
    .await;
    Ok(())
}

/// Hub server URL without a trailing slash, the input of the hub hash
fn hub_server(config: &kube::Config) -> String {
    config
        .cluster_url
        .to_string()
        .trim_end_matches('/')
        .to_string()
}

fn context(
    config: &WorkAgentConfig,
    hub_client: Client,
    spoke_client: Client,
    hub_hash: String,
    works: &SharedCache<ManifestWork>,
    applied_works: &SharedCache<AppliedManifestWork>,
) -> Result<AgentContext> {
    let validator = Arc::new(SubjectAccessReviewValidator::new(spoke_client.clone()));
    let mut builder = AgentContext::builder(hub_client, spoke_client, &config.cluster_name, hub_hash)
        .agent_name(&config.agent_name)
        .validator(validator)
        .stores(works.store(), applied_works.store())
        .status_sync_interval(config.status_sync_interval)
        .eviction_grace_period(config.eviction_grace_period);
    if let Some(agent_id) = &config.agent_id {
        builder = builder.agent_id(agent_id);
    }
    builder.build()
}

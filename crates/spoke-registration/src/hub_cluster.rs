//! ManagedCluster registration and lease renewal on the hub

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use spoke_common::crd::{ClientConfig, ManagedCluster, ManagedClusterSpec};

use crate::error::RegistrationError;

/// Lease the hub watches to judge agent liveness
pub const LEASE_NAME: &str = "managed-cluster-lease";

/// Lease renewal period advertised on the ManagedCluster
pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 60;

/// Hub-side cluster registration API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubClusterClient: Send + Sync {
    /// Create the ManagedCluster if it does not exist. Returns `true` if created.
    async fn ensure_managed_cluster(
        &self,
        cluster: ManagedCluster,
    ) -> Result<bool, RegistrationError>;

    /// Bump the cluster lease's renew time
    async fn renew_lease(
        &self,
        cluster_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError>;
}

/// Desired ManagedCluster for this spoke
pub fn managed_cluster(cluster_name: &str, spoke_server: Option<&str>) -> ManagedCluster {
    ManagedCluster::new(
        cluster_name,
        ManagedClusterSpec {
            hub_accepts_client: false,
            managed_cluster_client_configs: spoke_server
                .map(|url| {
                    vec![ClientConfig {
                        url: url.to_string(),
                        ca_bundle: None,
                    }]
                })
                .unwrap_or_default(),
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
        },
    )
}

/// [`HubClusterClient`] backed by the hub API server
pub struct KubeHubClusterClient {
    client: Client,
}

impl KubeHubClusterClient {
    /// Use the given hub client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HubClusterClient for KubeHubClusterClient {
    async fn ensure_managed_cluster(
        &self,
        cluster: ManagedCluster,
    ) -> Result<bool, RegistrationError> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        let name = cluster.metadata.name.clone().unwrap_or_default();
        if api.get_opt(&name).await?.is_some() {
            debug!(cluster = %name, "managed cluster already registered");
            return Ok(false);
        }
        match api.create(&PostParams::default(), &cluster).await {
            Ok(_) => {
                info!(cluster = %name, "created managed cluster on hub");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(
        &self,
        cluster_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), cluster_name);
        let patch = serde_json::json!({ "spec": { "renewTime": MicroTime(now) } });
        match api
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // The hub creates the lease once it accepts the cluster.
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(cluster = %cluster_name, "cluster lease not created yet");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

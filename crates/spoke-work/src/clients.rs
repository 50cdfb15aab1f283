//! Typed clients for the two work CRDs
//!
//! The hub client is scoped to the managed cluster's namespace; the spoke
//! client works on cluster-scoped AppliedManifestWorks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

use spoke_common::crd::{
    AppliedManifestWork, AppliedManifestWorkStatus, ManifestWork, ManifestWorkStatus,
};
use spoke_common::kube_utils::{patch_finalizers, patch_status};
use spoke_common::Result;

/// ManifestWork operations on the hub
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubWorkClient: Send + Sync {
    /// Replace the finalizer list of a ManifestWork
    async fn patch_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Write the status of a ManifestWork
    async fn patch_status(&self, name: &str, status: &ManifestWorkStatus) -> Result<()>;
}

/// AppliedManifestWork operations on the spoke
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpokeWorkClient: Send + Sync {
    /// Fetch an AppliedManifestWork, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<AppliedManifestWork>>;

    /// Create an AppliedManifestWork
    async fn create(&self, applied: AppliedManifestWork) -> Result<AppliedManifestWork>;

    /// Request deletion; a missing object is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Replace the applied resource list
    async fn patch_applied_resources(
        &self,
        name: &str,
        status: &AppliedManifestWorkStatus,
    ) -> Result<()>;

    /// Set or clear (`None`) the eviction start time
    async fn set_eviction_start_time(
        &self,
        name: &str,
        start: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Replace the finalizer list of an AppliedManifestWork
    async fn patch_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()>;
}

/// [`HubWorkClient`] for the ManifestWorks in one cluster namespace
pub struct KubeHubWorkClient {
    api: Api<ManifestWork>,
}

impl KubeHubWorkClient {
    /// Client for ManifestWorks in `cluster_name`'s namespace
    pub fn new(client: Client, cluster_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, cluster_name),
        }
    }
}

#[async_trait]
impl HubWorkClient for KubeHubWorkClient {
    async fn patch_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        patch_finalizers(&self.api, name, resource_version.as_deref(), finalizers).await
    }

    async fn patch_status(&self, name: &str, status: &ManifestWorkStatus) -> Result<()> {
        patch_status(&self.api, name, status).await?;
        Ok(())
    }
}

/// [`SpokeWorkClient`] backed by the spoke API server
pub struct KubeSpokeWorkClient {
    api: Api<AppliedManifestWork>,
}

impl KubeSpokeWorkClient {
    /// Client for AppliedManifestWorks on the spoke
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl SpokeWorkClient for KubeSpokeWorkClient {
    async fn get(&self, name: &str) -> Result<Option<AppliedManifestWork>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, applied: AppliedManifestWork) -> Result<AppliedManifestWork> {
        Ok(self.api.create(&PostParams::default(), &applied).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_applied_resources(
        &self,
        name: &str,
        status: &AppliedManifestWorkStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "status": { "appliedResources": status.applied_resources }
        });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_eviction_start_time(
        &self,
        name: &str,
        start: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // An explicit null removes the field under merge patch semantics.
        let patch = serde_json::json!({ "status": { "evictionStartTime": start } });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        patch_finalizers(&self.api, name, resource_version.as_deref(), finalizers).await
    }
}

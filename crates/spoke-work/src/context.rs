//! Shared dependencies of the work controllers
//!
//! [`AgentContext`] is built once per agent run and handed to every
//! controller behind an `Arc`. Use [`AgentContext::builder`]:
//!
//! ```text
//! let ctx = AgentContext::builder(hub_client, spoke_client, "cluster1", hub_hash)
//!     .stores(works, applied_works)
//!     .validator(validator)
//!     .build()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};

use spoke_common::crd::{applied_work_name, AppliedManifestWork, ManifestWork};
use spoke_common::events::{EventPublisher, KubeEventPublisher};
use spoke_common::{Error, Result};

use crate::applier::{DynamicApplier, ManifestApplier};
use crate::clients::{HubWorkClient, KubeHubWorkClient, KubeSpokeWorkClient, SpokeWorkClient};
use crate::validator::{ExecutorValidator, SubjectAccessReviewValidator};

/// Default interval between availability status syncs
pub const DEFAULT_STATUS_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Default grace period before an orphaned AppliedManifestWork is evicted
pub const DEFAULT_EVICTION_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Name events are reported under
const EVENT_REPORTER: &str = "work-agent";

/// Everything a work controller needs
pub struct AgentContext {
    /// ManifestWork API on the hub, scoped to the cluster namespace
    pub hub: Arc<dyn HubWorkClient>,
    /// AppliedManifestWork API on the spoke
    pub spoke: Arc<dyn SpokeWorkClient>,
    /// Manifest apply/delete on the spoke
    pub applier: Arc<dyn ManifestApplier>,
    /// Executor permission checks, shared by every apply
    pub validator: Arc<dyn ExecutorValidator>,
    /// Events about ManifestWorks, recorded on the hub
    pub hub_events: Arc<dyn EventPublisher>,
    /// Events about AppliedManifestWorks, recorded on the spoke
    pub spoke_events: Arc<dyn EventPublisher>,
    /// Cached ManifestWorks of this cluster
    pub works: Store<ManifestWork>,
    /// Cached AppliedManifestWorks on the spoke
    pub applied_works: Store<AppliedManifestWork>,
    /// Managed cluster name, also the hub namespace of its works
    pub cluster_name: String,
    /// Hash of the hub server URL
    pub hub_hash: String,
    /// ID recorded on the AppliedManifestWorks this agent owns
    pub agent_id: String,
    /// How often availability is re-checked
    pub status_sync_interval: Duration,
    /// How long an orphaned AppliedManifestWork survives
    pub eviction_grace_period: Duration,
}

impl AgentContext {
    /// Builder with Kubernetes-backed defaults for every collaborator
    pub fn builder(
        hub_client: Client,
        spoke_client: Client,
        cluster_name: impl Into<String>,
        hub_hash: impl Into<String>,
    ) -> AgentContextBuilder {
        AgentContextBuilder::new(hub_client, spoke_client, cluster_name.into(), hub_hash.into())
    }

    /// Cached ManifestWork named `name`
    pub fn work(&self, name: &str) -> Option<Arc<ManifestWork>> {
        self.works.get(&ObjectRef::new(name).within(&self.cluster_name))
    }

    /// Cached AppliedManifestWork named `name`
    pub fn applied_work(&self, name: &str) -> Option<Arc<AppliedManifestWork>> {
        self.applied_works.get(&ObjectRef::new(name))
    }

    /// Name of the AppliedManifestWork for the ManifestWork `work_name`
    pub fn applied_work_name(&self, work_name: &str) -> String {
        applied_work_name(&self.hub_hash, work_name)
    }

    /// Whether `applied` belongs to this agent
    pub fn owns(&self, applied: &AppliedManifestWork) -> bool {
        applied.spec.agent_id == self.agent_id
    }

    /// Context backed by the given collaborators, for tests
    #[cfg(test)]
    pub fn for_testing(
        hub: Arc<dyn HubWorkClient>,
        spoke: Arc<dyn SpokeWorkClient>,
        applier: Arc<dyn ManifestApplier>,
        validator: Arc<dyn ExecutorValidator>,
        works: Store<ManifestWork>,
        applied_works: Store<AppliedManifestWork>,
    ) -> Self {
        use spoke_common::events::NoopEventPublisher;

        Self {
            hub,
            spoke,
            applier,
            validator,
            hub_events: Arc::new(NoopEventPublisher),
            spoke_events: Arc::new(NoopEventPublisher),
            works,
            applied_works,
            cluster_name: "cluster1".to_string(),
            hub_hash: "hubhash".to_string(),
            agent_id: "hubhash".to_string(),
            status_sync_interval: DEFAULT_STATUS_SYNC_INTERVAL,
            eviction_grace_period: DEFAULT_EVICTION_GRACE_PERIOD,
        }
    }
}

/// Builder for [`AgentContext`]
pub struct AgentContextBuilder {
    hub_client: Client,
    spoke_client: Client,
    cluster_name: String,
    hub_hash: String,
    agent_id: Option<String>,
    agent_name: Option<String>,
    validator: Option<Arc<dyn ExecutorValidator>>,
    applier: Option<Arc<dyn ManifestApplier>>,
    stores: Option<(Store<ManifestWork>, Store<AppliedManifestWork>)>,
    status_sync_interval: Duration,
    eviction_grace_period: Duration,
}

impl AgentContextBuilder {
    fn new(hub_client: Client, spoke_client: Client, cluster_name: String, hub_hash: String) -> Self {
        Self {
            hub_client,
            spoke_client,
            cluster_name,
            hub_hash,
            agent_id: None,
            agent_name: None,
            validator: None,
            applier: None,
            stores: None,
            status_sync_interval: DEFAULT_STATUS_SYNC_INTERVAL,
            eviction_grace_period: DEFAULT_EVICTION_GRACE_PERIOD,
        }
    }

    /// Agent ID; defaults to the hub hash
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Agent name reported as the event instance
    pub fn agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    /// Executor validator; defaults to SubjectAccessReviews on the spoke
    pub fn validator(mut self, validator: Arc<dyn ExecutorValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Manifest applier; defaults to the dynamic API on the spoke
    pub fn applier(mut self, applier: Arc<dyn ManifestApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Cache stores the controllers read from
    pub fn stores(
        mut self,
        works: Store<ManifestWork>,
        applied_works: Store<AppliedManifestWork>,
    ) -> Self {
        self.stores = Some((works, applied_works));
        self
    }

    /// Availability re-check interval
    pub fn status_sync_interval(mut self, interval: Duration) -> Self {
        self.status_sync_interval = interval;
        self
    }

    /// Grace period for orphaned AppliedManifestWorks
    pub fn eviction_grace_period(mut self, grace: Duration) -> Self {
        self.eviction_grace_period = grace;
        self
    }

    /// Build the context. Fails if no stores were given.
    pub fn build(self) -> Result<AgentContext> {
        let (works, applied_works) = self.stores.ok_or_else(|| {
            Error::internal_with_context("AgentContext", "controllers need cache stores")
        })?;
        let agent_id = self.agent_id.unwrap_or_else(|| self.hub_hash.clone());

        Ok(AgentContext {
            hub: Arc::new(KubeHubWorkClient::new(
                self.hub_client.clone(),
                &self.cluster_name,
            )),
            spoke: Arc::new(KubeSpokeWorkClient::new(self.spoke_client.clone())),
            applier: self
                .applier
                .unwrap_or_else(|| DynamicApplier::new(self.spoke_client.clone()) as Arc<_>),
            validator: self.validator.unwrap_or_else(|| {
                Arc::new(SubjectAccessReviewValidator::new(self.spoke_client.clone())) as Arc<_>
            }),
            hub_events: Arc::new(KubeEventPublisher::new(
                self.hub_client,
                EVENT_REPORTER,
                self.agent_name.clone(),
            )),
            spoke_events: Arc::new(KubeEventPublisher::new(
                self.spoke_client,
                EVENT_REPORTER,
                self.agent_name,
            )),
            works,
            applied_works,
            cluster_name: self.cluster_name,
            hub_hash: self.hub_hash,
            agent_id,
            status_sync_interval: self.status_sync_interval,
            eviction_grace_period: self.eviction_grace_period,
        })
    }
}

/// Object reference used to attach events to `obj`
pub fn event_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

//! ManifestWork lifecycle controllers
//!
//! - **add_finalizer**: puts the cleanup finalizer on live ManifestWorks
//! - **apply**: applies manifests and reports per-manifest status to the hub
//! - **work_finalize**: removes the AppliedManifestWork of a deleted
//!   ManifestWork, then releases the hub finalizer
//! - **applied_sync**: prunes resources a ManifestWork no longer declares
//! - **applied_finalize**: deletes applied resources of a deleted
//!   AppliedManifestWork, then releases the spoke finalizer
//! - **unmanaged**: evicts AppliedManifestWorks whose ManifestWork is gone
//! - **availability**: reports whether applied resources still exist

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::warn;

use spoke_common::Error;

use crate::context::AgentContext;

pub mod add_finalizer;
pub mod applied_finalize;
pub mod applied_sync;
pub mod apply;
pub mod availability;
pub mod unmanaged;
pub mod work_finalize;

/// Requeue delay after a failed reconcile
pub const REQUEUE_ERROR: Duration = Duration::from_secs(5);

/// Requeue delay while deletions are in flight
pub const REQUEUE_DELETION: Duration = Duration::from_secs(5);

/// Periodic re-apply of every ManifestWork, standing in for an informer resync
pub const HUB_RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Shared error policy: log and retry after a fixed delay
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<AgentContext>) -> Action {
    warn!(
        name = %obj.name_any(),
        namespace = ?obj.namespace(),
        error = %error,
        "reconcile failed, requeueing"
    );
    Action::requeue(REQUEUE_ERROR)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use kube::api::ObjectMeta;
    use kube::runtime::reflector::{self, Store};
    use kube::runtime::watcher;
    use kube::Resource;

    use spoke_common::crd::{
        AppliedManifestResourceMeta, AppliedManifestWork, AppliedManifestWorkSpec,
        AppliedManifestWorkStatus, Manifest, ManifestWork, ManifestWorkSpec, ManifestsTemplate,
    };
    use spoke_common::{APPLIED_MANIFEST_WORK_FINALIZER, MANIFEST_WORK_FINALIZER};

    use crate::applier::MockManifestApplier;
    use crate::clients::{MockHubWorkClient, MockSpokeWorkClient};
    use crate::context::AgentContext;
    use crate::validator::MockExecutorValidator;

    /// Store pre-filled with `objects`
    pub fn store_with<K>(objects: Vec<K>) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + 'static,
    {
        let (reader, mut writer) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        reader
    }

    pub fn configmap(name: &str) -> Manifest {
        Manifest(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default" },
        }))
    }

    /// ManifestWork in `cluster1` carrying the hub finalizer
    pub fn work(name: &str, manifests: Vec<Manifest>) -> ManifestWork {
        let mut work = ManifestWork::new(
            name,
            ManifestWorkSpec {
                workload: ManifestsTemplate { manifests },
                executor: None,
            },
        );
        work.metadata.namespace = Some("cluster1".to_string());
        work.metadata.generation = Some(1);
        work.metadata.resource_version = Some("10".to_string());
        work.metadata.finalizers = Some(vec![MANIFEST_WORK_FINALIZER.to_string()]);
        work
    }

    pub fn deleting(mut meta: ObjectMeta) -> ObjectMeta {
        meta.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        meta
    }

    /// AppliedManifestWork owned by the test agent for `work_name`
    pub fn applied(work_name: &str, resources: Vec<AppliedManifestResourceMeta>) -> AppliedManifestWork {
        let mut applied = AppliedManifestWork::new(
            &format!("hubhash-{}", work_name),
            AppliedManifestWorkSpec {
                hub_hash: "hubhash".to_string(),
                agent_id: "hubhash".to_string(),
                manifest_work_name: work_name.to_string(),
            },
        );
        applied.metadata.uid = Some("amw-uid".to_string());
        applied.metadata.resource_version = Some("20".to_string());
        applied.metadata.finalizers = Some(vec![APPLIED_MANIFEST_WORK_FINALIZER.to_string()]);
        applied.status = Some(AppliedManifestWorkStatus {
            applied_resources: resources,
            eviction_start_time: None,
        });
        applied
    }

    pub fn applied_configmap(name: &str, uid: &str) -> AppliedManifestResourceMeta {
        AppliedManifestResourceMeta {
            group: String::new(),
            version: "v1".to_string(),
            resource: "configmaps".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Mock collaborators, turned into a context once expectations are set
    pub struct Mocks {
        pub hub: MockHubWorkClient,
        pub spoke: MockSpokeWorkClient,
        pub applier: MockManifestApplier,
        pub validator: MockExecutorValidator,
        pub works: Vec<ManifestWork>,
        pub applied: Vec<AppliedManifestWork>,
    }

    impl Mocks {
        pub fn new() -> Self {
            Self {
                hub: MockHubWorkClient::new(),
                spoke: MockSpokeWorkClient::new(),
                applier: MockManifestApplier::new(),
                validator: MockExecutorValidator::new(),
                works: Vec::new(),
                applied: Vec::new(),
            }
        }

        pub fn into_context(self) -> Arc<AgentContext> {
            Arc::new(AgentContext::for_testing(
                Arc::new(self.hub),
                Arc::new(self.spoke),
                Arc::new(self.applier),
                Arc::new(self.validator),
                store_with(self.works),
                store_with(self.applied),
            ))
        }
    }
}

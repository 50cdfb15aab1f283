//! Custom Resource Definitions used by the spoke work agent
//!
//! ManifestWork and ManagedCluster live on the hub; AppliedManifestWork and
//! ClusterClaim are provisioned on the spoke at startup.

mod applied_manifest_work;
mod cluster;
mod manifest_work;
mod types;

pub use applied_manifest_work::{
    applied_work_name, AppliedManifestResourceMeta, AppliedManifestWork, AppliedManifestWorkSpec,
    AppliedManifestWorkStatus,
};
pub use cluster::{
    ClientConfig, ClusterClaim, ClusterClaimSpec, ManagedCluster, ManagedClusterSpec,
    ManagedClusterStatus, MANAGED_CLUSTER_JOINED,
};
pub use manifest_work::{
    ExecutorSubjectType, Manifest, ManifestCondition, ManifestResourceMeta, ManifestResourceStatus,
    ManifestWork, ManifestWorkExecutor, ManifestWorkExecutorSubject, ManifestWorkSpec,
    ManifestWorkStatus, ManifestsTemplate, ServiceAccountSubject, WORK_APPLIED, WORK_AVAILABLE,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus, ResourceIdentifier};

//! Common types for the spoke work agent: CRDs, errors, clients and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by the agent
pub const FIELD_MANAGER: &str = "work-agent";

/// Finalizer the agent places on hub ManifestWorks.
///
/// Blocks hub-side deletion until the applied resources on the spoke are gone.
pub const MANIFEST_WORK_FINALIZER: &str = "cluster.open-cluster-management.io/manifest-work-cleanup";

/// Finalizer the agent places on spoke AppliedManifestWorks
pub const APPLIED_MANIFEST_WORK_FINALIZER: &str =
    "cluster.open-cluster-management.io/applied-manifest-work-cleanup";

/// Label carrying the managed cluster name (CSRs, leases)
pub const CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";

/// Label carrying the agent name (CSRs)
pub const AGENT_NAME_LABEL: &str = "open-cluster-management.io/agent-name";

/// Prefix of every identity the hub issues to spoke agents
pub const IDENTITY_PREFIX: &str = "system:open-cluster-management";

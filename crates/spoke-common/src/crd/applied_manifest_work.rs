//! AppliedManifestWork CRD: the agent's local record of applied work
//!
//! One AppliedManifestWork exists on the spoke per ManifestWork the agent
//! applied. Every resource created for a ManifestWork carries an owner
//! reference to it, so deleting it garbage-collects the applied resources.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ResourceIdentifier;

/// Record of what the agent applied for one hub ManifestWork.
///
/// Cluster-scoped. The name is `{hubHash}-{manifestWorkName}`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "AppliedManifestWork",
    status = "AppliedManifestWorkStatus",
    printcolumn = r#"{"name":"Work","type":"string","jsonPath":".spec.manifestWorkName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestWorkSpec {
    /// Hash of the hub server URL the ManifestWork came from
    pub hub_hash: String,

    /// ID of the agent that owns this record
    #[serde(default)]
    pub agent_id: String,

    /// Name of the ManifestWork on the hub
    pub manifest_work_name: String,
}

/// Status of an AppliedManifestWork
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestWorkStatus {
    /// Resources applied on the spoke for the ManifestWork
    #[serde(default)]
    pub applied_resources: Vec<AppliedManifestResourceMeta>,

    /// When the owning ManifestWork was first observed missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_start_time: Option<DateTime<Utc>>,
}

/// One resource applied on the spoke
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedManifestResourceMeta {
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Namespace ("" when cluster-scoped)
    #[serde(default)]
    pub namespace: String,
    /// Object name
    pub name: String,
    /// UID of the object when it was applied
    #[serde(default)]
    pub uid: String,
}

impl AppliedManifestResourceMeta {
    /// Group/resource/namespace/name of the object
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Name of the AppliedManifestWork for a ManifestWork from the given hub
pub fn applied_work_name(hub_hash: &str, work_name: &str) -> String {
    format!("{}-{}", hub_hash, work_name)
}

impl AppliedManifestWork {
    /// Whether the object carries the given finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Whether deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Applied resources recorded in status
    pub fn applied_resources(&self) -> &[AppliedManifestResourceMeta] {
        self.status
            .as_ref()
            .map(|s| s.applied_resources.as_slice())
            .unwrap_or_default()
    }

    /// Eviction clock start, if running
    pub fn eviction_start_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.eviction_start_time)
    }
}

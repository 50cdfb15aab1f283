//! ManifestWork CRD: a hub-declared unit of work for one managed cluster
//!
//! ManifestWorks live on the hub in the namespace named after the managed
//! cluster. The agent only reads their spec and writes their status and
//! finalizers; it never provisions this CRD itself.

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Metadata, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition type set once every manifest was applied
pub const WORK_APPLIED: &str = "Applied";
/// Condition type set once every applied resource exists on the spoke
pub const WORK_AVAILABLE: &str = "Available";

/// ManifestWork declares the manifests to apply on a managed cluster.
///
/// Example:
/// ```yaml
/// apiVersion: work.open-cluster-management.io/v1
/// kind: ManifestWork
/// metadata:
///   name: hello
///   namespace: cluster1
/// spec:
///   workload:
///     manifests:
///       - apiVersion: v1
///         kind: ConfigMap
///         metadata:
///           name: hello
///           namespace: default
///         data:
///           greeting: hi
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "ManifestWork",
    namespaced,
    status = "ManifestWorkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    /// Manifests to apply on the managed cluster
    #[serde(default)]
    pub workload: ManifestsTemplate,

    /// Identity the agent acts as when applying the manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ManifestWorkExecutor>,
}

/// Wrapper around the list of embedded manifests
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManifestsTemplate {
    /// Raw Kubernetes objects
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

/// A raw embedded Kubernetes object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Manifest(pub serde_json::Value);

impl JsonSchema for Manifest {
    fn schema_name() -> String {
        "Manifest".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        let mut schema = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            metadata: Some(Box::new(Metadata {
                description: Some("Raw Kubernetes object to apply".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        schema
            .extensions
            .insert("x-kubernetes-preserve-unknown-fields".to_string(), true.into());
        schema
            .extensions
            .insert("x-kubernetes-embedded-resource".to_string(), true.into());
        Schema::Object(schema)
    }
}

/// Executor identity for applying the manifests
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManifestWorkExecutor {
    /// Subject the agent impersonates for authorization checks
    pub subject: ManifestWorkExecutorSubject,
}

/// Executor subject
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkExecutorSubject {
    /// Subject type; only `ServiceAccount` is supported
    #[serde(rename = "type")]
    pub type_: ExecutorSubjectType,

    /// Service account details when `type` is `ServiceAccount`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountSubject>,
}

/// Kind of executor subject
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExecutorSubjectType {
    /// A service account on the managed cluster
    ServiceAccount,
}

/// Service account reference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceAccountSubject {
    /// Service account namespace
    pub namespace: String,
    /// Service account name
    pub name: String,
}

impl ServiceAccountSubject {
    /// Username the API server uses for this service account
    pub fn username(&self) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, self.name)
    }
}

/// Status of a ManifestWork as reported by the agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkStatus {
    /// Aggregate conditions (Applied, Available)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per-manifest status
    #[serde(default)]
    pub resource_status: ManifestResourceStatus,
}

/// Per-manifest status list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManifestResourceStatus {
    /// One entry per manifest, ordered by ordinal
    #[serde(default)]
    pub manifests: Vec<ManifestCondition>,
}

/// Status of one manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCondition {
    /// Which object this status is about
    pub resource_meta: ManifestResourceMeta,

    /// Applied/Available conditions for this manifest
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Identity of one applied manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResourceMeta {
    /// Index of the manifest in `spec.workload.manifests`
    pub ordinal: i32,
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Kind
    #[serde(default)]
    pub kind: String,
    /// Plural resource name
    #[serde(default)]
    pub resource: String,
    /// Object name
    #[serde(default)]
    pub name: String,
    /// Object namespace
    #[serde(default)]
    pub namespace: String,
}

impl ManifestResourceMeta {
    /// Group/resource/namespace/name of the object
    pub fn identifier(&self) -> super::ResourceIdentifier {
        super::ResourceIdentifier {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl ManifestWork {
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

    /// Identifiers of the resources recorded in `status.resourceStatus`
    pub fn declared_resources(&self) -> Vec<super::ResourceIdentifier> {
        self.status
            .as_ref()
            .map(|s| {
                s.resource_status
                    .manifests
                    .iter()
                    .map(|m| m.resource_meta.identifier())
                    .collect()
            })
            .unwrap_or_default()
    }
}

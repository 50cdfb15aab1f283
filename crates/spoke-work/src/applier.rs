//! Applying and deleting manifests on the spoke cluster
//!
//! Manifests are arbitrary Kubernetes objects, so the applier works with
//! `DynamicObject` and resolves kinds to resources through API discovery.
//! Discovery results are cached for the life of the process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{
    Api, DeleteParams, DynamicObject, Patch, PatchParams, Preconditions, PropagationPolicy,
};
use kube::core::{ApiResource, GroupVersion, GroupVersionKind};
use kube::discovery::{self, ApiCapabilities, Scope};
use kube::Client;
use tracing::{debug, trace};

use spoke_common::crd::{
    AppliedManifestResourceMeta, Manifest, ManifestResourceMeta, ResourceIdentifier,
};
use spoke_common::{Error, Result, FIELD_MANAGER};

/// A manifest with its kind resolved to a resource on the spoke
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedManifest {
    /// API group ("" for core)
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub resource: String,
    /// Namespace ("" when cluster-scoped)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResolvedManifest {
    /// Group/resource/namespace/name of the object
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            group: self.group.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Status metadata for the manifest at `ordinal`
    pub fn resource_meta(&self, ordinal: i32) -> ManifestResourceMeta {
        ManifestResourceMeta {
            ordinal,
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            resource: self.resource.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Applied resource record for the object with `uid`
    pub fn applied(&self, uid: impl Into<String>) -> AppliedManifestResourceMeta {
        AppliedManifestResourceMeta {
            group: self.group.clone(),
            version: self.version.clone(),
            resource: self.resource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: uid.into(),
        }
    }
}

/// Fields every manifest must carry before it can be resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestHeader {
    /// Group/version/kind from `apiVersion` and `kind`
    pub gvk: GroupVersionKind,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
}

impl ManifestHeader {
    /// Read the header of a raw manifest
    pub fn parse(manifest: &Manifest) -> Result<Self> {
        let obj = &manifest.0;
        let api_version = obj
            .pointer("/apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("manifest has no apiVersion"))?;
        let kind = obj
            .pointer("/kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("manifest has no kind"))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation_for(kind, "manifest has no metadata.name"))?;
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Ok(Self {
            gvk: GroupVersionKind::gvk(&group, &version, kind),
            name: name.to_string(),
            namespace,
        })
    }

    /// Header metadata usable in status before the kind is resolved
    pub fn unresolved_meta(&self, ordinal: i32) -> ManifestResourceMeta {
        ManifestResourceMeta {
            ordinal,
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            kind: self.gvk.kind.clone(),
            resource: String::new(),
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
        }
    }
}

/// Spoke-side operations on manifests and the objects they produce
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Resolve a manifest's kind to a resource on the spoke
    async fn resolve(&self, manifest: &Manifest) -> Result<ResolvedManifest>;

    /// Server-side apply a manifest with `owner` added to its owner
    /// references. Returns the UID of the applied object.
    async fn apply(
        &self,
        target: &ResolvedManifest,
        manifest: &Manifest,
        owner: &OwnerReference,
    ) -> Result<String>;

    /// Delete an applied object with background propagation, guarded by its
    /// recorded UID. Returns `true` while the object still exists.
    async fn delete(&self, resource: &AppliedManifestResourceMeta) -> Result<bool>;

    /// Whether the applied object still exists with its recorded UID
    async fn exists(&self, resource: &AppliedManifestResourceMeta) -> Result<bool>;
}

/// [`ManifestApplier`] using the dynamic API
pub struct DynamicApplier {
    client: Client,
    kinds: DashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>,
    resources: DashMap<(String, String, String), (ApiResource, ApiCapabilities)>,
}

impl DynamicApplier {
    /// Applier against the spoke cluster behind `client`
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self {
            client,
            kinds: DashMap::new(),
            resources: DashMap::new(),
        })
    }

    async fn discover_kind(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.kinds.get(gvk) {
            return Ok(found.clone());
        }
        let found = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| {
                Error::validation_for(
                    format!("{}/{}", gvk.api_version(), gvk.kind),
                    format!("kind not served by the spoke: {}", e),
                )
            })?;
        self.kinds.insert(gvk.clone(), found.clone());
        Ok(found)
    }

    async fn discover_resource(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<(ApiResource, ApiCapabilities)> {
        let key = (group.to_string(), version.to_string(), resource.to_string());
        if let Some(found) = self.resources.get(&key) {
            return Ok(found.clone());
        }
        let gv = GroupVersion::gv(group, version);
        let api_group = discovery::pinned_group(&self.client, &gv).await?;
        let found = api_group
            .versioned_resources(version)
            .into_iter()
            .find(|(ar, _)| ar.plural == resource)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "discover_resource",
                    format!("resource {}/{} not found", gv.api_version(), resource),
                )
            })?;
        self.resources.insert(key, found.clone());
        Ok(found)
    }

    fn api(&self, ar: &ApiResource, caps: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
        match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, ar),
            Scope::Cluster => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl ManifestApplier for DynamicApplier {
    async fn resolve(&self, manifest: &Manifest) -> Result<ResolvedManifest> {
        let header = ManifestHeader::parse(manifest)?;
        let (ar, caps) = self.discover_kind(&header.gvk).await?;
        let namespace = match (caps.scope, header.namespace) {
            (Scope::Namespaced, Some(ns)) => ns,
            (Scope::Namespaced, None) => {
                return Err(Error::validation_for(
                    format!("{} {}", header.gvk.kind, header.name),
                    "namespaced manifest has no metadata.namespace",
                ))
            }
            (Scope::Cluster, _) => String::new(),
        };
        Ok(ResolvedManifest {
            group: ar.group,
            version: ar.version,
            kind: ar.kind,
            resource: ar.plural,
            namespace,
            name: header.name,
        })
    }

    async fn apply(
        &self,
        target: &ResolvedManifest,
        manifest: &Manifest,
        owner: &OwnerReference,
    ) -> Result<String> {
        let (ar, caps) = self
            .discover_resource(&target.group, &target.version, &target.resource)
            .await?;
        let api = self.api(&ar, &caps, &target.namespace);

        let obj = with_owner(&manifest.0, owner)?;
        let applied = api
            .patch(
                &target.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await
            .map_err(|e| Error::apply(target.identifier().to_string(), e.to_string()))?;
        trace!(resource = %target.identifier(), "applied manifest");

        applied.metadata.uid.ok_or_else(|| {
            Error::apply(target.identifier().to_string(), "applied object has no uid")
        })
    }

    async fn delete(&self, resource: &AppliedManifestResourceMeta) -> Result<bool> {
        let (ar, caps) = self
            .discover_resource(&resource.group, &resource.version, &resource.resource)
            .await?;
        let api = self.api(&ar, &caps, &resource.namespace);

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: (!resource.uid.is_empty()).then(|| Preconditions {
                uid: Some(resource.uid.clone()),
                resource_version: None,
            }),
            ..Default::default()
        };
        match api.delete(&resource.name, &params).await {
            Ok(either) => Ok(either.is_left()),
            // 409: the UID precondition failed, so the recorded object is gone
            // and a different one now holds the name.
            Err(kube::Error::Api(e)) if e.code == 404 || e.code == 409 => {
                debug!(resource = %resource.identifier(), code = e.code, "applied resource already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, resource: &AppliedManifestResourceMeta) -> Result<bool> {
        let (ar, caps) = self
            .discover_resource(&resource.group, &resource.version, &resource.resource)
            .await?;
        let api = self.api(&ar, &caps, &resource.namespace);
        let found = api.get_opt(&resource.name).await?;
        Ok(found.is_some_and(|obj| {
            resource.uid.is_empty() || obj.metadata.uid.as_deref() == Some(resource.uid.as_str())
        }))
    }
}

/// Copy of `manifest` with `owner` appended to its owner references
pub fn with_owner(manifest: &serde_json::Value, owner: &OwnerReference) -> Result<serde_json::Value> {
    let mut obj = manifest.clone();
    let owner = serde_json::to_value(owner)?;
    let metadata = obj
        .as_object_mut()
        .ok_or_else(|| Error::validation("manifest is not an object"))?
        .entry("metadata")
        .or_insert_with(|| serde_json::json!({}));
    let metadata = metadata
        .as_object_mut()
        .ok_or_else(|| Error::validation("manifest metadata is not an object"))?;
    let refs = metadata
        .entry("ownerReferences")
        .or_insert_with(|| serde_json::json!([]));
    let refs = refs
        .as_array_mut()
        .ok_or_else(|| Error::validation("ownerReferences is not a list"))?;
    if !refs.iter().any(|r| r.get("uid") == owner.get("uid")) {
        refs.push(owner);
    }
    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configmap() -> Manifest {
        Manifest(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm1", "namespace": "default" },
            "data": { "a": "b" },
        }))
    }

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "work.open-cluster-management.io/v1".to_string(),
            kind: "AppliedManifestWork".to_string(),
            name: "abc-work".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }
    }

    mod header {
        use super::*;

        #[test]
        fn core_group_has_empty_group() {
            let header = ManifestHeader::parse(&configmap()).unwrap();
            assert_eq!(header.gvk.group, "");
            assert_eq!(header.gvk.version, "v1");
            assert_eq!(header.gvk.kind, "ConfigMap");
            assert_eq!(header.name, "cm1");
            assert_eq!(header.namespace.as_deref(), Some("default"));
        }

        #[test]
        fn named_group_is_split() {
            let manifest = Manifest(serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "web", "namespace": "prod" },
            }));
            let header = ManifestHeader::parse(&manifest).unwrap();
            assert_eq!(header.gvk.group, "apps");
            assert_eq!(header.gvk.version, "v1");
        }

        #[test]
        fn missing_name_is_a_validation_error() {
            let manifest = Manifest(serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {},
            }));
            let err = ManifestHeader::parse(&manifest).unwrap_err();
            assert!(!err.is_retryable());
        }

        #[test]
        fn unresolved_meta_keeps_header_fields() {
            let meta = ManifestHeader::parse(&configmap()).unwrap().unresolved_meta(2);
            assert_eq!(meta.ordinal, 2);
            assert_eq!(meta.kind, "ConfigMap");
            assert!(meta.resource.is_empty());
        }
    }

    mod owner_refs {
        use super::*;

        #[test]
        fn owner_is_appended_once() {
            let obj = with_owner(&configmap().0, &owner()).unwrap();
            let obj = with_owner(&obj, &owner()).unwrap();
            let refs = obj["metadata"]["ownerReferences"].as_array().unwrap();
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0]["kind"], "AppliedManifestWork");
            assert_eq!(refs[0]["uid"], "uid-1");
            assert_eq!(obj["data"]["a"], "b");
        }

        #[test]
        fn existing_owners_are_kept() {
            let mut manifest = configmap().0;
            manifest["metadata"]["ownerReferences"] = serde_json::json!([{
                "apiVersion": "v1", "kind": "Namespace", "name": "default", "uid": "ns-uid"
            }]);
            let obj = with_owner(&manifest, &owner()).unwrap();
            assert_eq!(obj["metadata"]["ownerReferences"].as_array().unwrap().len(), 2);
        }

        #[test]
        fn non_object_manifest_is_rejected() {
            assert!(with_owner(&serde_json::json!("nope"), &owner()).is_err());
        }
    }

    #[test]
    fn resolved_manifest_builds_status_records() {
        let resolved = ResolvedManifest {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            resource: "deployments".to_string(),
            namespace: "prod".to_string(),
            name: "web".to_string(),
        };
        let meta = resolved.resource_meta(0);
        assert_eq!(meta.identifier(), resolved.identifier());
        let applied = resolved.applied("uid-9");
        assert_eq!(applied.identifier(), resolved.identifier());
        assert_eq!(applied.uid, "uid-9");
    }
}

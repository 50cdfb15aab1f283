//! CRD provisioning
//!
//! The spoke needs the AppliedManifestWork and ClusterClaim CRDs before any
//! controller starts. They are generated from the typed definitions in
//! `spoke_common::crd`, kept in a fixed order, and installed with
//! server-side apply so repeated startups converge instead of failing.
//! Nothing here ever deletes a CRD.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use spoke_common::crd::{AppliedManifestWork, ClusterClaim};
use spoke_common::{Error, Result, FIELD_MANAGER};

/// One CRD with the manifest file name it is published under
#[derive(Clone, Debug)]
pub struct CrdDef {
    /// Versioned manifest name, which also fixes the install order
    pub file: &'static str,
    /// CRD object name (`{plural}.{group}`)
    pub name: &'static str,
    /// The definition itself
    pub crd: CustomResourceDefinition,
}

/// The CRDs the agent provisions on the spoke.
///
/// Built once in `main` and handed to whatever needs the definitions.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    crds: Vec<CrdDef>,
}

impl SchemaRegistry {
    /// Registry holding the spoke CRDs
    pub fn spoke() -> Self {
        Self {
            crds: vec![
                CrdDef {
                    file: "0000_01_work.open-cluster-management.io_appliedmanifestworks.crd.yaml",
                    name: AppliedManifestWork::crd_name(),
                    crd: AppliedManifestWork::crd(),
                },
                CrdDef {
                    file: "0000_02_clusters.open-cluster-management.io_clusterclaims.crd.yaml",
                    name: ClusterClaim::crd_name(),
                    crd: ClusterClaim::crd(),
                },
            ],
        }
    }

    /// Definitions in install order
    pub fn crds(&self) -> &[CrdDef] {
        &self.crds
    }

    /// All definitions as one multi-document YAML stream
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for def in &self.crds {
            let doc = serde_yaml::to_string(&def.crd).map_err(|e| {
                Error::serialization(format!("failed to render {}: {}", def.file, e))
            })?;
            out.push_str("---\n");
            out.push_str(&format!("# {}\n", def.file));
            out.push_str(&doc);
        }
        Ok(out)
    }
}

/// Installs the registry's CRDs with server-side apply
pub struct CrdProvisioner {
    client: Client,
    registry: SchemaRegistry,
}

impl CrdProvisioner {
    /// Provisioner for `registry` against the spoke behind `client`
    pub fn new(client: Client, registry: SchemaRegistry) -> Self {
        Self { client, registry }
    }

    /// Create or update every CRD, in order. Stops at the first failure.
    pub async fn install(&self) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for def in self.registry.crds() {
            info!(crd = def.name, file = def.file, "applying CRD");
            api.patch(def.name, &params, &Patch::Apply(&def.crd))
                .await
                .map_err(|e| Error::apply(def.name, e.to_string()))?;
        }
        info!(count = self.registry.crds().len(), "CRDs installed/updated");
        Ok(())
    }
}

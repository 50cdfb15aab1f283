//! Cluster CRDs: ClusterClaim (spoke) and ManagedCluster (hub)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition type the hub sets once it accepts the cluster
pub const MANAGED_CLUSTER_JOINED: &str = "ManagedClusterJoined";

/// ClusterClaim exposes a property of the managed cluster.
///
/// Provisioned on the spoke at startup so other components can publish
/// claims before the agent syncs them.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterClaim",
    printcolumn = r#"{"name":"Value","type":"string","jsonPath":".spec.value"}"#
)]
pub struct ClusterClaimSpec {
    /// Claim value
    #[serde(default)]
    pub value: String,
}

/// ManagedCluster represents this spoke on the hub
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    status = "ManagedClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Set by a hub admin once the cluster is accepted
    #[serde(default)]
    pub hub_accepts_client: bool,

    /// How the hub can reach the spoke API server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_cluster_client_configs: Vec<ClientConfig>,

    /// Lease renewal period expected from the agent
    #[serde(default)]
    pub lease_duration_seconds: i32,
}

/// Spoke API server endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// API server URL
    pub url: String,
    /// Base64 CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Status of a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ManagedClusterStatus {
    /// Conditions set by the hub and the agent
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn cluster_claim_crd_metadata() {
        let crd = ClusterClaim::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("clusterclaims.cluster.open-cluster-management.io")
        );
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn managed_cluster_serializes_camel_case() {
        let cluster = ManagedCluster::new(
            "cluster1",
            ManagedClusterSpec {
                hub_accepts_client: false,
                managed_cluster_client_configs: vec![ClientConfig {
                    url: "https://10.0.0.1:6443".to_string(),
                    ca_bundle: None,
                }],
                lease_duration_seconds: 60,
            },
        );
        let value = serde_json::to_value(&cluster).unwrap();
        assert_eq!(value["spec"]["leaseDurationSeconds"], 60);
        assert_eq!(
            value["spec"]["managedClusterClientConfigs"][0]["url"],
            "https://10.0.0.1:6443"
        );
    }
}

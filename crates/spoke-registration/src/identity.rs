//! Agent identity and how it is encoded in hub-issued client certificates

use std::fmt;

use spoke_common::IDENTITY_PREFIX;
use x509_parser::prelude::*;

use crate::error::CertError;

/// Expected identity of this agent instance: `{cluster}:{agent}`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    /// Managed cluster name; also the hub namespace holding our work
    pub cluster_name: String,
    /// Agent name, unique per agent installation
    pub agent_name: String,
}

impl AgentIdentity {
    /// Create an identity
    pub fn new(cluster_name: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            agent_name: agent_name.into(),
        }
    }

    /// Certificate subject common name the hub issues for this identity
    pub fn common_name(&self) -> String {
        format!(
            "{}:{}:{}",
            IDENTITY_PREFIX, self.cluster_name, self.agent_name
        )
    }

    /// Organization (group) scoping the certificate to this cluster
    pub fn cluster_group(&self) -> String {
        format!("{}:{}", IDENTITY_PREFIX, self.cluster_name)
    }

    /// Parse `system:open-cluster-management:{cluster}:{agent}`.
    ///
    /// Returns `None` for any other shape, including empty parts.
    pub fn from_common_name(cn: &str) -> Option<Self> {
        let rest = cn.strip_prefix(IDENTITY_PREFIX)?.strip_prefix(':')?;
        let (cluster, agent) = rest.split_once(':')?;
        if cluster.is_empty() || agent.is_empty() || agent.contains(':') {
            return None;
        }
        Some(Self::new(cluster, agent))
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster_name, self.agent_name)
    }
}

/// Subject common name of the leaf (first) certificate in a PEM bundle
pub fn leaf_common_name(cert_pem: &[u8]) -> Result<String, CertError> {
    let block = ::pem::parse(cert_pem).map_err(|e| CertError::Parse(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| CertError::Parse(format!("failed to parse certificate: {}", e)))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or(CertError::MissingCommonName)?;
    Ok(cn.to_string())
}

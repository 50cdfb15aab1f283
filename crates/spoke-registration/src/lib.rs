//! Hub trust for the spoke work agent
//!
//! Three parts share the hub kubeconfig directory:
//! - the registration sub-process ([`RegistrationAgent`]) obtains and rotates
//!   the client certificate and keeps the cluster lease fresh
//! - the bootstrapper ([`HubTrustBootstrapper`]) blocks startup until the
//!   certificate store reports a valid certificate for our identity
//! - the watcher ([`CredentialWatcher`]) tells the agent when a rotated
//!   certificate has to be picked up by rebuilding the hub clients

#![deny(missing_docs)]

pub mod agent;
pub mod cert_store;
pub mod csr;
pub mod error;
pub mod hub_cluster;
pub mod hub_trust;
pub mod identity;
pub mod rotation;

pub use agent::{
    resolve_agent_name, KubeRegistrationBackend, RegistrationAgent, RegistrationBackend,
    RegistrationConfig,
};
pub use cert_store::{CertificateStore, HubKubeconfigDir, TrustProbe, TrustState};
pub use error::{CertError, RegistrationError, TrustError};
pub use hub_trust::{HubConnection, HubTrustBootstrapper};
pub use identity::AgentIdentity;
pub use rotation::{CredentialSnapshot, CredentialWatcher};

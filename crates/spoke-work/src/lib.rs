//! ManifestWork lifecycle on the spoke
//!
//! Applies the manifests of the hub ManifestWorks addressed to this cluster,
//! records what was applied in AppliedManifestWorks, reports status back to
//! the hub and cleans up when work is deleted or orphaned.

#![deny(missing_docs)]

pub mod applier;
pub mod cache;
pub mod clients;
pub mod context;
pub mod controllers;
pub mod launcher;
pub mod runner;
pub mod validator;

pub use context::{AgentContext, DEFAULT_EVICTION_GRACE_PERIOD, DEFAULT_STATUS_SYNC_INTERVAL};
pub use launcher::{WorkAgent, WorkAgentConfig};
pub use runner::DEFAULT_WORKERS;

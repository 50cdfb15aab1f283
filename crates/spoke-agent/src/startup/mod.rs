//! Startup utilities for the work agent

mod crds;
mod supervisor;

pub use crds::{CrdDef, CrdProvisioner, SchemaRegistry};
pub use supervisor::{Supervisor, TaskFailure};

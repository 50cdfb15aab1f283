//! Spoke work agent: startup orchestration and command line surface

#![deny(missing_docs)]

pub mod options;
pub mod orchestrator;
pub mod startup;

pub use options::{AgentOptions, Cli, Commands};
pub use orchestrator::{run_agent, Orchestrator, StartupError};
pub use startup::{SchemaRegistry, Supervisor};

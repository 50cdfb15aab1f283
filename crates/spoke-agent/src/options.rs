//! Command line options

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use spoke_common::kube_utils::RateLimit;
use spoke_registration::HubKubeconfigDir;
use spoke_work::WorkAgentConfig;

/// Open Cluster Management spoke work agent
#[derive(Parser, Debug)]
#[command(name = "spoke-agent", version, about, long_about = None)]
pub struct Cli {
    /// What to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the work agent
    ///
    /// Provisions the spoke CRDs, registers with the hub, waits for a trusted
    /// hub client certificate and then runs the ManifestWork controllers.
    Agent(AgentOptions),

    /// Print the CRDs provisioned on the spoke as YAML and exit
    Crds,
}

/// Options of the `agent` subcommand
#[derive(Args, Clone, Debug)]
pub struct AgentOptions {
    /// Name of the managed cluster this agent serves
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// Agent name; persisted in the hub kubeconfig dir when generated
    #[arg(long, env = "AGENT_NAME")]
    pub agent_name: Option<String>,

    /// Kubeconfig used to register with the hub
    #[arg(long, env = "BOOTSTRAP_KUBECONFIG", default_value = "/spoke/bootstrap/kubeconfig")]
    pub bootstrap_kubeconfig: PathBuf,

    /// Directory holding the hub kubeconfig, tls.key and tls.crt
    #[arg(long, env = "HUB_KUBECONFIG_DIR", default_value = "/spoke/hub-kubeconfig")]
    pub hub_kubeconfig_dir: PathBuf,

    /// Kubeconfig of the spoke cluster; in-cluster config when unset
    #[arg(long, env = "SPOKE_KUBECONFIG")]
    pub spoke_kubeconfig: Option<PathBuf>,

    /// Spoke API server URL advertised on the ManagedCluster
    #[arg(long)]
    pub spoke_external_server_url: Option<String>,

    /// ID recorded on AppliedManifestWorks; defaults to the hub hash
    #[arg(long)]
    pub agent_id: Option<String>,

    /// Sustained requests per second against each cluster
    #[arg(long, default_value_t = 50.0)]
    pub spoke_kube_api_qps: f32,

    /// Request burst against each cluster
    #[arg(long, default_value_t = 100)]
    pub spoke_kube_api_burst: u32,

    /// Interval between availability status checks
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub status_sync_interval: Duration,

    /// How long an AppliedManifestWork without ManifestWork is kept
    #[arg(
        long = "appliedmanifestwork-eviction-grace-period",
        default_value = "10m",
        value_parser = humantime::parse_duration
    )]
    pub eviction_grace_period: Duration,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Interval between hub trust probes
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub hub_trust_poll_interval: Duration,

    /// OTLP gRPC endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl AgentOptions {
    /// Client throttling from the QPS and burst flags
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            qps: self.spoke_kube_api_qps,
            burst: self.spoke_kube_api_burst,
        }
    }

    /// The hub kubeconfig directory
    pub fn hub_dir(&self) -> HubKubeconfigDir {
        HubKubeconfigDir::new(&self.hub_kubeconfig_dir)
    }

    /// Work controller settings for `agent_name`
    pub fn work_config(&self, agent_name: &str) -> WorkAgentConfig {
        let mut config = WorkAgentConfig::new(
            &self.cluster_name,
            agent_name,
            self.hub_dir().kubeconfig_path(),
        );
        config.spoke_kubeconfig = self.spoke_kubeconfig.clone();
        config.agent_id = self.agent_id.clone();
        config.rate = self.rate_limit();
        config.status_sync_interval = self.status_sync_interval;
        config.eviction_grace_period = self.eviction_grace_period;
        config.workers = self.workers;
        config
    }
}

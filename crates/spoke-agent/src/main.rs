//! Spoke work agent binary

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use spoke_agent::{run_agent, Cli, Commands, SchemaRegistry, Supervisor};
use spoke_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let registry = SchemaRegistry::spoke();

    match cli.command {
        Commands::Crds => {
            print!("{}", registry.to_yaml()?);
            Ok(())
        }
        Commands::Agent(options) => {
            init_telemetry(TelemetryConfig {
                otlp_endpoint: options.otlp_endpoint.clone(),
                cluster_name: Some(options.cluster_name.clone()),
                ..Default::default()
            })?;

            let token = CancellationToken::new();
            Supervisor::new(token.clone()).spawn("signals", shutdown_on_signal(token.clone()));

            if run_agent(options, registry, token).await.is_err() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Cancel `token` on SIGTERM or SIGINT
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = token.cancelled() => return,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
            _ = token.cancelled() => return,
        }
    }

    token.cancel();
}

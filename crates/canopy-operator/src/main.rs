//! Canopy operator - workspace admission, namespace scheduling and virtual workspaces

mod cli;
mod runner;

use std::sync::Arc;

use clap::Parser;
use kube::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use canopy_common::client::ClusterClients;
use canopy_common::telemetry::{init_telemetry, TelemetryConfig};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if let Commands::Crd = cli.command {
        for crd in runner::crds() {
            println!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    let service_name = match &cli.command {
        Commands::Scheduler(_) => "canopy-scheduler",
        Commands::Webhook(_) => "canopy-webhook",
        Commands::VirtualWorkspaces(_) => "canopy-virtual-workspaces",
        Commands::Crd => "canopy",
    };
    let _telemetry = init_telemetry(TelemetryConfig {
        service_name: service_name.to_string(),
        log_format: cli.log_format,
        ..Default::default()
    })?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
            token.cancel();
        }
    });

    match cli.command {
        Commands::Scheduler(args) => {
            let clients = cluster_clients(&cli.cluster_routing).await?;
            runner::run_scheduler(clients, args, token).await
        }
        Commands::Webhook(args) => runner::run_webhook(args, token).await,
        Commands::VirtualWorkspaces(args) => {
            let clients = cluster_clients(&cli.cluster_routing).await?;
            runner::run_virtual_workspaces(clients, args, token).await
        }
        Commands::Crd => Ok(()),
    }?;

    info!("Shut down cleanly");
    Ok(())
}

async fn cluster_clients(
    routing: &canopy_common::client::ClusterRouting,
) -> anyhow::Result<Arc<ClusterClients>> {
    let config = Config::infer().await?;
    Ok(Arc::new(ClusterClients::new(config, *routing)?))
}

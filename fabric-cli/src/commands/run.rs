//! Run command - start a controller and serve until interrupted.

use anyhow::{Context, Result};
use fabric_cluster::{ClusterConfig, Controller, DecoderRegistry, StartOutcome};

/// Run the controller described by `config`.
pub async fn run(config: ClusterConfig) -> Result<()> {
    tracing::info!(
        bind = %config.bind_address,
        data_dir = %config.data_dir.display(),
        "Starting controller"
    );

    let outcome = Controller::start(config, DecoderRegistry::with_defaults())
        .await
        .context("Failed to start controller")?;

    let controller = match outcome {
        StartOutcome::Running(controller) => controller,
        StartOutcome::Recovered => {
            println!("raft configuration reset to only include local node");
            return Ok(());
        }
    };

    println!("Controller {} listening on {}", controller.server_id(), controller.advertise_addr());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    controller.shutdown().await.context("Failed to stop controller")?;
    Ok(())
}

//! Recover command - reset membership to the local node after quorum loss.

use anyhow::{bail, Context, Result};
use fabric_cluster::{ClusterConfig, Controller, DecoderRegistry, StartOutcome};

/// Rewrite the membership in `config.data_dir` to contain only this node.
pub async fn run(mut config: ClusterConfig) -> Result<()> {
    config.recover = true;
    let outcome = Controller::start(config, DecoderRegistry::with_defaults())
        .await
        .context("Recovery failed")?;

    match outcome {
        StartOutcome::Recovered => {
            println!("raft configuration reset to only include local node");
            Ok(())
        }
        StartOutcome::Running(controller) => {
            let _ = controller.shutdown().await;
            bail!("controller started instead of recovering")
        }
    }
}

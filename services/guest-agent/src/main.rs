//! vmagent guest agent
//!
//! Reconciles the extensions named by a goal-state document, uploads the
//! aggregate status, then keeps the telemetry batcher and environment
//! monitor running until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmagent_guest_agent::status;
use vmagent_guest_agent::telemetry::{BatcherConfig, TelemetryBatcher};
use vmagent_guest_agent::{
    AgentContext, AgentState, Config, EnvMonitor, LinuxHost, MonitorConfig, Reconciler,
};
use vmagent_wire::RetryPolicy;

#[derive(Debug, Parser)]
#[command(name = "guest-agent", version, about = "vmagent guest extension agent")]
struct Args {
    /// Goal-state extensions document to reconcile.
    #[arg(env = "VMAGENT_GOAL_STATE")]
    goal_state: PathBuf,

    /// Exit after the first reconciliation pass and status upload.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        lib_dir = %config.lib_dir.display(),
        extension_log_dir = %config.extension_log_dir.display(),
        endpoint = %config.endpoint,
        "Starting vmagent guest agent"
    );

    let ctx = AgentContext::new(config, RetryPolicy::default(), Arc::new(LinuxHost::new()))
        .context("failed to build wire transport")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let batcher_handle = tokio::spawn(
        TelemetryBatcher::new(&ctx, BatcherConfig::default()).run(shutdown_rx.clone()),
    );
    let monitor_handle =
        tokio::spawn(EnvMonitor::new(&ctx, MonitorConfig::default()).run(shutdown_rx.clone()));

    let document = tokio::fs::read_to_string(&args.goal_state)
        .await
        .with_context(|| format!("failed to read goal state {}", args.goal_state.display()))?;

    let reconciler = Reconciler::new(&ctx);
    match reconciler.reconcile_document(&document).await {
        Ok((goal, outcome)) => {
            if let Err(e) =
                status::build_and_upload(&ctx, &goal, &outcome.descriptors, &AgentState::Ready)
                    .await
            {
                error!(error = %e, "Status upload failed");
            }
        }
        Err(e) => error!(error = %e, "Goal state rejected"),
    }

    if !args.once {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("Received shutdown signal");
    }

    let _ = shutdown_tx.send(true);
    for (task, handle) in [("telemetry", batcher_handle), ("monitor", monitor_handle)] {
        if let Err(e) = handle.await {
            warn!(task, error = %e, "Background task panicked");
        }
    }

    info!("Guest agent shutdown complete");
    Ok(())
}

mod cli;
mod config;
mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use frameloop_tasks::TaskManager;

use crate::cli::CliArgs;
use crate::config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Load config
    let mut config = CliConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    config.apply_args(&args);
    config.log_summary();

    let manager = TaskManager::new(config.manager.clone());
    let demo = demo::install(&manager, &config).context("failed to register tasks")?;
    info!(
        frames = %demo.frame_task.name(),
        heartbeat = %demo.heartbeat_task.name(),
        "Demo tasks registered"
    );

    // Interrupts only stop scheduling; the loop tears the pools down itself.
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        os_signal().await;
        info!("Interrupt received, shutting down");
        signal_manager.request_shutdown();
    });

    let cycles = if config.threaded {
        let handle = manager.spawn().context("failed to start task loop")?;
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("task loop join failed")?
            .context("task loop failed")?
    } else {
        tokio::task::block_in_place(|| manager.run_blocking()).context("task loop failed")?
    };

    info!(cycles, frames = demo.frames(), "Task loop finished");

    let metrics = manager.metrics();
    println!(
        "{}",
        serde_json::to_string_pretty(&metrics).context("failed to serialize metrics")?
    );
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}

//! minicluster container entrypoint.
//!
//! Starts one cluster from `MAC_*` settings, prints the coordination
//! endpoint, installs artifacts dropped into the extension mount and stops
//! the cluster on SIGINT/SIGTERM.
//!
//! ```bash
//! MAC_NUM_TSERVERS=1 MAC_ZOOKEEPER_PORT=21811 minicluster
//! ```

mod settings;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use minicluster::{ClusterState, DefaultClasspathLoader, JvmLauncher, Orchestrator};
use settings::{Settings, SettingsLoader};
use std::path::PathBuf;
use std::sync::Arc;
use watcher::MountWatcher;

/// Run a disposable storage cluster until interrupted.
#[derive(Parser)]
#[command(name = "minicluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file, applied before MAC_* environment variables.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Print the resolved settings as TOML and exit.
    #[arg(long)]
    print_settings: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = SettingsLoader::new();
    if let Some(path) = &cli.settings {
        loader = loader.with_file(path);
    }
    let settings = loader.load()?;

    if cli.print_settings {
        print!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.log_level)
                .context("Invalid MAC_LOG_LEVEL")?,
        )
        .init();

    run(settings).await
}

async fn run(settings: Settings) -> Result<()> {
    let mut classpath = DefaultClasspathLoader::from_env();
    if let Some(base) = &settings.classpath {
        classpath = classpath.with_base(base);
    }
    let mut launcher = JvmLauncher::new(Arc::new(classpath));
    if let Some(java) = settings.java() {
        launcher = launcher.with_java(java);
    }

    let mut watcher = MountWatcher::new(&settings.extension_mount);
    let mut orchestrator = Orchestrator::new(Arc::new(launcher));
    for artifact in watcher.scan()? {
        tracing::info!(artifact = %artifact.display(), "queued extension from mount");
        orchestrator = orchestrator.with_extension(artifact);
    }

    let mut cluster = orchestrator
        .start(settings.to_builder())
        .await
        .context("Failed to start cluster")?;
    let info = cluster.connection_info()?;
    println!("COORDINATION={}", info.coordination_endpoint);
    tracing::info!(
        instance = %info.instance_name,
        root = %info.storage_root.display(),
        "cluster ready"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(settings.watch_interval());

    let outcome = loop {
        tokio::select! {
            signal = &mut shutdown => {
                tracing::info!(%signal, "shutting down");
                break Ok(());
            }
            _ = ticker.tick() => {
                if cluster.state() == ClusterState::Failed {
                    break Err(anyhow::anyhow!("a cluster service exited unexpectedly"));
                }
                let fresh = watcher.scan().unwrap_or_else(|e| {
                    tracing::error!(error = %e, "could not scan extension mount");
                    Vec::new()
                });
                for artifact in fresh {
                    match cluster.install_extension(&artifact) {
                        Ok(installed) => tracing::warn!(
                            artifact = %installed.target_name(),
                            "new extension installed; restart the container to guarantee tablet servers load it"
                        ),
                        Err(e) => tracing::error!(artifact = %artifact.display(), error = %e, "could not install extension"),
                    }
                }
            }
        }
    };

    let report = cluster.stop().await.context("Failed to stop cluster")?;
    for warning in &report.warnings {
        tracing::warn!(%warning, "forced shutdown");
    }
    outcome
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = tokio::signal::ctrl_c() => "SIGINT",
            },
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

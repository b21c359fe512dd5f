use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use notesync_core::{BlobStore, DeviceIdentity, Settings};
use notesync_engine::{AutoSyncScheduler, RunHistory, RunOutcome, SyncEngine, SyncMode};
use notesync_github::GitHubStore;
use notesync_local::config::{Command, Config};
use notesync_local::{FsBlobStore, VaultSource};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let data_dir = config.data_dir();
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&data_dir));

    if let Command::History { limit } = config.command {
        return print_history(store, limit).await;
    }

    let mut settings = Settings::load(store.as_ref())
        .await
        .with_context(|| format!("Invalid settings in {}", data_dir.display()))?;
    if let Some(token) = &config.github_token {
        settings.remote.token = token.clone();
    }

    let device = DeviceIdentity::load_or_create(store.as_ref(), settings.device_name.as_deref()).await?;
    info!("Starting notesync on {} ({})", device.name, device.id);
    info!("  Data dir: {}", data_dir.display());

    let vault = config.vault.clone().unwrap_or_default();
    let remote = Arc::new(GitHubStore::new(&settings.remote)?);
    let source = Arc::new(VaultSource::new(&vault));
    let engine = Arc::new(
        SyncEngine::new(source, remote, store, device)
            .with_progress(Arc::new(|line: &str| info!("{}", line))),
    );

    match config.command {
        Command::Run { mode } => {
            require_vault(&config)?;
            let mode = mode.map(SyncMode::from).unwrap_or_else(|| SyncMode::for_settings(&settings));
            report(engine.run_once(&settings, mode).await?);
        }
        Command::Force { mode } => {
            require_vault(&config)?;
            let mode = mode.map(SyncMode::from).unwrap_or_else(|| SyncMode::for_settings(&settings));
            report(engine.force_sync_overriding_lock(&settings, mode).await?);
        }
        Command::Daemon => {
            require_vault(&config)?;
            settings.validate()?;
            settings.auto_sync.enabled = true;
            let scheduler = AutoSyncScheduler::new(engine.clone(), settings);
            scheduler.start();

            let mut shutdown_rx = create_shutdown_signal();
            let _ = shutdown_rx.wait_for(|&v| v).await;

            scheduler.stop();
            if scheduler.is_running() {
                info!("Waiting for the current sync run to finish");
                while scheduler.is_running() {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            }
            info!("Daemon shutdown complete");
        }
        Command::ClearCache { yes, yes_really } => {
            let pending = engine.begin_cache_clear();
            if !(yes || confirm("Clear the sync cache? Every item will be uploaded again.").await?)
            {
                println!("Cache left untouched");
                return Ok(());
            }
            let confirmed = pending.confirm();
            if !(yes_really || confirm("Really clear it? This cannot be undone.").await?) {
                println!("Cache left untouched");
                return Ok(());
            }
            let deleted = confirmed.confirm_again().await?;
            println!("Cleared {} cache blobs", deleted);
        }
        Command::History { .. } => unreachable!("handled before engine setup"),
    }

    Ok(())
}

fn require_vault(config: &Config) -> anyhow::Result<()> {
    match &config.vault {
        Some(vault) if vault.is_dir() => Ok(()),
        Some(vault) => anyhow::bail!("Vault {} is not a directory", vault.display()),
        None => anyhow::bail!("No vault given (--vault or NOTESYNC_VAULT)"),
    }
}

fn report(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed(result) => {
            println!("{}", result.summary());
            for failure in &result.failures {
                println!("  failed {}: {}", failure.path, failure.error);
            }
        }
        RunOutcome::Skipped(reason) => println!("Skipped: {}", reason),
    }
}

async fn print_history(store: Arc<dyn BlobStore>, limit: usize) -> anyhow::Result<()> {
    let history = RunHistory::new(store);
    let records = history.records().await;

    for record in records.iter().rev().take(limit) {
        let started = chrono::DateTime::from_timestamp(record.started_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| record.started_at.to_string());
        println!(
            "{}  {:>8}  docs {:>4} up {:>3} failed  assets {:>4} up {:>3} failed  {}ms",
            started,
            record.device,
            record.documents_uploaded,
            record.documents_failed,
            record.assets_uploaded,
            record.assets_failed,
            record.duration_ms
        );
    }

    let stats = history.statistics().await;
    println!(
        "{} runs, {} uploads, {} failures",
        stats.total_runs, stats.total_uploaded, stats.total_failed
    );
    Ok(())
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{} [y/N] ", question).as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, initiating shutdown");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}

//! Command handlers

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;

use weft_runtime::{Registry, WorkerPool, WorkerPoolConfig, WorkflowHandle};
use weft_store::SqliteStore;

use crate::{Cli, Commands};

pub async fn dispatch(cli: Cli, registry: Registry) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker {
            workers,
            poll_interval,
        } => worker(&cli.database_url, registry, workers, poll_interval).await,
        Commands::Init => init(&cli.database_url).await,
        Commands::List { status, limit } => list(&cli.database_url, status, limit).await,
        Commands::Inspect {
            workflow_id,
            events,
        } => inspect(&cli.database_url, &workflow_id, events).await,
        Commands::Stats => stats(&cli.database_url).await,
        Commands::Clean { force, no_backup } => clean(&cli.database_url, force, no_backup),
    }
}

async fn open_store(database_url: &str) -> anyhow::Result<SqliteStore> {
    if let Some(dir) = database_path(database_url).and_then(|p| p.parent().map(Path::to_path_buf))
    {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create data directory {}", dir.display()))?;
        }
    }

    let store = SqliteStore::connect(database_url)
        .await
        .with_context(|| format!("cannot open database {database_url}"))?;
    store.init().await.context("migration failed")?;
    Ok(store)
}

async fn worker(
    database_url: &str,
    registry: Registry,
    workers: usize,
    poll_interval: f64,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(database_url).await?);
    let config = WorkerPoolConfig::new()
        .with_workers(workers)
        .with_poll_interval(Duration::from_secs_f64(poll_interval));

    let pool = WorkerPool::new(store, Arc::new(registry), config);
    pool.start();

    wait_for_termination().await?;
    pool.shutdown().await;
    Ok(())
}

async fn wait_for_termination() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("termination signal received");
    Ok(())
}

async fn init(database_url: &str) -> anyhow::Result<()> {
    open_store(database_url).await?;
    println!("database initialized: {database_url}");
    Ok(())
}

async fn list(database_url: &str, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let store = open_store(database_url).await?;
    let status = status
        .map(|s| {
            s.to_uppercase()
                .parse::<weft_core::WorkflowStatus>()
                .map_err(|e| anyhow::anyhow!(e))
        })
        .transpose()?;

    let rows = weft_store::EventStore::list_workflows(&store, status, limit).await?;
    if rows.is_empty() {
        println!("no workflows");
        return Ok(());
    }

    println!(
        "{:<34} {:<24} {:<10} {:<20}",
        "ID", "NAME", "STATUS", "CREATED"
    );
    for row in rows {
        println!(
            "{:<34} {:<24} {:<10} {:<20}",
            row.id,
            row.name,
            row.status,
            row.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn inspect(database_url: &str, workflow_id: &str, events: bool) -> anyhow::Result<()> {
    let store = Arc::new(open_store(database_url).await?);
    let handle = WorkflowHandle::with_id(store, workflow_id);

    let info = handle.info().await?;
    println!("id:          {}", info.id);
    println!("name:        {}", info.name);
    println!("version:     {}", info.version);
    println!("module:      {}", info.module);
    println!("status:      {}", info.status);
    println!("input:       {}", info.input);
    println!("created_at:  {}", info.created_at.to_rfc3339());
    println!("updated_at:  {}", info.updated_at.to_rfc3339());

    if events {
        println!();
        println!("{:<6} {:<22} PAYLOAD", "SEQ", "TYPE");
        for record in handle.events().await? {
            let payload = serde_json::to_string(&record.event)?;
            println!("{:<6} {:<22} {}", record.id, record.event.kind(), payload);
        }
    }
    Ok(())
}

async fn stats(database_url: &str) -> anyhow::Result<()> {
    let store = open_store(database_url).await?;
    let stats = weft_store::EventStore::stats(&store).await?;

    println!("workflows:");
    for (status, count) in &stats.workflows {
        println!("  {status:<10} {count}");
    }
    println!("tasks:");
    for (status, count) in &stats.tasks {
        println!("  {status:<10} {count}");
    }
    println!("events:      {}", stats.events);
    println!("logs:        {}", stats.logs);
    Ok(())
}

fn clean(database_url: &str, force: bool, no_backup: bool) -> anyhow::Result<()> {
    let Some(path) = database_path(database_url) else {
        bail!("clean only supports sqlite: file URLs, got {database_url}");
    };

    if !path.exists() {
        println!("nothing to clean: {} does not exist", path.display());
        return Ok(());
    }

    if !force {
        print!("delete {}? [y/N] ", path.display());
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return Ok(());
        }
    }

    if !no_backup {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let backup = path.with_extension(format!("bak-{stamp}"));
        std::fs::copy(&path, &backup)
            .with_context(|| format!("cannot back up to {}", backup.display()))?;
        println!("backed up to {}", backup.display());
    }

    std::fs::remove_file(&path)?;
    // SQLite sidecar files, present when WAL mode was used.
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }

    println!("removed {}", path.display());
    Ok(())
}

/// Extract the filesystem path from a `sqlite:` URL, ignoring query
/// parameters. Returns None for non-file databases (`:memory:`).
fn database_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

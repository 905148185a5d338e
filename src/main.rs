use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use temp_file_host::{
    client::{
        api::{FileHostApi, HttpClient},
        gallery::Gallery,
        manager::{QueueEvent, UploadHandle},
        queue::EntryStatus,
        worker::{ChunkPolicy, UploadSource},
    },
    config::{AppConfig, Cli, ClientArgs, ClientConfig, Command},
    models::file_kind::format_size,
    server,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => {
            let (cfg, migrate) = AppConfig::from_env_and_args(args)?;
            server::serve(cfg, migrate).await
        }
        Command::Upload { client, files } => upload(client, files).await,
        Command::List { client } => list(client).await,
        Command::Delete { client, public_id } => {
            let api = connect(client)?;
            api.delete_file(&public_id)
                .await
                .with_context(|| format!("deleting {}", public_id))?;
            tracing::info!("Deleted {}", public_id);
            Ok(())
        }
        Command::Download {
            client,
            public_id,
            output,
        } => {
            let mut gallery = Gallery::new(Arc::new(connect(client)?));
            gallery.refresh().await?;
            let (path, bytes) = gallery.download(&public_id, output.as_deref()).await?;
            tracing::info!("Saved {} ({}) to {}", public_id, format_size(bytes), path.display());
            Ok(())
        }
    }
}

fn connect(args: ClientArgs) -> Result<HttpClient> {
    let cfg = ClientConfig::from_env_and_args(args);
    tracing::debug!("Using server {}", cfg.server);
    Ok(HttpClient::new(cfg.server)?)
}

async fn upload(client: ClientArgs, files: Vec<PathBuf>) -> Result<()> {
    let api: Arc<dyn FileHostApi> = Arc::new(connect(client)?);

    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        let source = UploadSource::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        sources.push(source);
    }

    let queue = UploadHandle::spawn(api, ChunkPolicy::default());
    let mut events = queue.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::debug!("skipped {} queue events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    queue.enqueue(sources).await?;
    tokio::select! {
        res = queue.wait_idle() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling remaining uploads");
            for entry in queue.snapshot().await? {
                queue.cancel(entry.id).await?;
            }
        }
    }

    let failed: Vec<_> = queue
        .snapshot()
        .await?
        .into_iter()
        .filter(|e| e.status == EntryStatus::Error)
        .collect();
    drop(queue);
    reporter.abort();

    if !failed.is_empty() {
        for entry in &failed {
            tracing::error!(
                "{} failed: {}",
                entry.name(),
                entry.error.as_deref().unwrap_or("unknown error")
            );
        }
        anyhow::bail!("{} of {} upload(s) failed", failed.len(), files.len());
    }
    Ok(())
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::Enqueued { name, size, .. } => {
            tracing::info!("Queued {} ({})", name, format_size(*size))
        }
        QueueEvent::Started { name, .. } => tracing::info!("Uploading {}", name),
        QueueEvent::Progress { id, progress } => tracing::info!(
            "{}: {:.1}% at {}/s",
            id,
            progress.percent(),
            format_size(progress.speed as u64)
        ),
        QueueEvent::Completed {
            name,
            object,
            persist_error,
            ..
        } => match persist_error {
            None => tracing::info!("{} -> {}", name, object.url),
            Some(err) => tracing::warn!(
                "{} -> {} (not recorded in the gallery: {})",
                name,
                object.url,
                err
            ),
        },
        QueueEvent::Failed { name, error, .. } => tracing::error!("{} failed: {}", name, error),
        QueueEvent::Cancelled { id } => tracing::info!("Cancelled {}", id),
        QueueEvent::Retried { id, position } => {
            tracing::info!("Retrying {} at position {}", id, position)
        }
    }
}

async fn list(client: ClientArgs) -> Result<()> {
    let mut gallery = Gallery::new(Arc::new(connect(client)?));
    let items = gallery.refresh().await?;
    if items.is_empty() {
        println!("No files uploaded yet.");
        return Ok(());
    }
    for item in items {
        println!(
            "{:<9} {:>10}  {}{}\n          {}\n          {}",
            item.category.as_str(),
            item.display_size(),
            item.name(),
            if item.is_pending_delete() {
                " (deleting)"
            } else {
                ""
            },
            item.file.public_id,
            item.file.url,
        );
    }
    Ok(())
}

mod config;
mod detector;
mod metrics;
mod orchestrator;
mod reference;
mod store;
#[cfg(test)]
mod testing;
mod training;
mod wms;

use crate::config::{Cli, Command, DetectArgs, DetectorKind, TrainingArgs};
use crate::detector::{Detector, HttpDetector, LabelDirDetector};
use crate::metrics::Metrics;
use crate::orchestrator::{BatchTotals, Orchestrator, TileProcessor};
use crate::reference::PgReference;
use crate::store::PgStore;
use crate::training::{find_chips, TrainingLoader};
use crate::wms::WmsClient;
use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tilegeo::{TileGrid, TilePlan};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    run_id: String,
    command: &'static str,
    started_at: String,
    elapsed_secs: f64,
    totals: &'a BatchTotals,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let run_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(run_id = %run_id, config = ?cli, "Loaded configuration");

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);
    if let Some(addr) = cli.metrics_listen_addr {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
                    return;
                }
            };
            tracing::info!(addr = %addr, "Metrics server started");
            if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });
    }

    let started_at = chrono::Utc::now();
    let clock = Instant::now();
    let (command, summary_path) = match &cli.command {
        Command::Detect(args) => ("detect", args.summary_path.clone()),
        Command::LoadTraining(args) => ("load-training", args.summary_path.clone()),
    };

    let run = async {
        match cli.command {
            Command::Detect(args) => detect(args, metrics.clone()).await,
            Command::LoadTraining(args) => load_training(args, metrics.clone()).await,
        }
    };

    let totals = tokio::select! {
        totals = run => totals?,
        _ = shutdown_signal() => {
            return Err(interrupted(&run_id, command, &metrics, clock.elapsed()));
        }
    };

    let summary = RunSummary {
        run_id,
        command,
        started_at: started_at.to_rfc3339(),
        elapsed_secs: clock.elapsed().as_secs_f64(),
        totals: &totals,
    };
    log_summary(&summary);
    if let Some(path) = summary_path {
        write_summary(&path, &summary).await?;
    }
    Ok(())
}

async fn detect(args: DetectArgs, metrics: Arc<Metrics>) -> anyhow::Result<BatchTotals> {
    let batch = args.batch_config()?;
    let store = Arc::new(
        PgStore::connect(&args.db, args.max_db_connections())
            .await
            .context("Failed to connect to PostgreSQL")?,
    );
    if args.db.truncate {
        store.truncate().await.context("Failed to truncate output tables")?;
    }

    let plan = match (args.area, &args.grid_table) {
        (Some(area), _) => TilePlan::Computed(TileGrid::new(area, batch.footprint)),
        (None, Some(table)) => TilePlan::Listed(
            store
                .load_grid(table)
                .await
                .with_context(|| format!("Failed to load tile origins from {table}"))?,
        ),
        (None, None) => anyhow::bail!("either --area or --grid-table is required"),
    };
    tracing::info!(tiles = plan.len(), "Tile plan ready");

    let reference = Arc::new(PgReference::new(
        store.pool().clone(),
        &args.db.cadastre_table,
        &args.db.address_table,
        args.db.srid,
    )?);
    let fetcher = Arc::new(WmsClient::new(args.wms_config()?).context("Failed to build WMS client")?);
    let detectors = build_detectors(&args)?;
    let processor = Arc::new(TileProcessor::new(reference, store.clone(), metrics.clone()));

    let orchestrator = Orchestrator::new(batch, fetcher, detectors, processor, metrics)?;
    let totals = orchestrator.run(plan.origins()).await?;
    store.close().await;
    Ok(totals)
}

fn build_detectors(args: &DetectArgs) -> anyhow::Result<Vec<Arc<dyn Detector>>> {
    match args.detector {
        DetectorKind::Http => {
            if args.detector_urls.is_empty() {
                anyhow::bail!("--detector-urls is required for the http detector");
            }
            let timeout = Duration::from_secs(args.request_timeout_secs);
            (0..args.worker_count())
                .map(|worker| {
                    let url = &args.detector_urls[worker % args.detector_urls.len()];
                    tracing::info!(worker, url = %url, "Assigned detector endpoint");
                    let detector = HttpDetector::new(url.clone(), args.model_path.as_deref(), timeout)?;
                    Ok(Arc::new(detector) as Arc<dyn Detector>)
                })
                .collect()
        }
        DetectorKind::LabelDir => {
            let dir = args
                .detections_dir
                .clone()
                .context("--detections-dir is required for the label-dir detector")?;
            Ok(vec![Arc::new(LabelDirDetector::new(dir)) as Arc<dyn Detector>])
        }
    }
}

async fn load_training(args: TrainingArgs, metrics: Arc<Metrics>) -> anyhow::Result<BatchTotals> {
    let concurrency = args.concurrency();
    let store = Arc::new(
        PgStore::connect(&args.db, concurrency as u32 + 1)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );
    if args.db.truncate {
        store.truncate().await.context("Failed to truncate output tables")?;
    }

    let reference = Arc::new(PgReference::new(
        store.pool().clone(),
        &args.db.cadastre_table,
        &args.db.address_table,
        args.db.srid,
    )?);
    let processor = Arc::new(TileProcessor::new(reference, store.clone(), metrics.clone()));

    let (search_dir, extension) = (args.search_dir.clone(), args.extension.clone());
    let chips = tokio::task::spawn_blocking(move || find_chips(&search_dir, &extension)).await?;

    let loader = TrainingLoader::new(processor, metrics, args.labels_dir_suffix, concurrency);
    let totals = loader.run(chips).await;
    store.close().await;
    Ok(totals)
}

fn log_summary(summary: &RunSummary<'_>) {
    let totals = summary.totals;
    tracing::info!(
        run_id = %summary.run_id,
        command = summary.command,
        elapsed_secs = summary.elapsed_secs,
        tiles_requested = totals.tiles_requested,
        tiles_processed = totals.tiles_processed,
        tiles_with_labels = totals.tiles_with_labels,
        tiles_skipped = totals.tiles_skipped,
        downloads_failed = totals.downloads_failed_total(),
        labels_recorded = totals.labels_recorded,
        missing_parcel_ids = totals.parcel_misses,
        missing_address_ids = totals.address_misses,
        reference_errors = totals.reference_errors,
        persist_failures = totals.persist_failures,
        "Run complete"
    );
}

/// Logs progress so far from the run's counters. The returned error makes
/// the process exit non-zero.
fn interrupted(run_id: &str, command: &str, metrics: &Metrics, elapsed: Duration) -> anyhow::Error {
    tracing::warn!(
        run_id = %run_id,
        command,
        elapsed_secs = elapsed.as_secs_f64(),
        tiles_requested = metrics.tiles_requested_total.get(),
        images_recorded = metrics.images_recorded_total.get(),
        labels_recorded = metrics.labels_recorded_total.get(),
        reference_errors = metrics.reference_errors_total.get(),
        persist_failures = metrics.persist_failures_total.get(),
        "Shutdown signal received, run incomplete"
    );
    anyhow::anyhow!(
        "{command} run {run_id} interrupted after {} tiles",
        metrics.tiles_requested_total.get()
    )
}

async fn write_summary(path: &Path, summary: &RunSummary<'_>) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(summary)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    tracing::info!(path = %path.display(), "Wrote run summary");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for the cleanup map tile publisher.
//!
//! `cleanup_map publish` renders and uploads a new tile version for every
//! selected area with pending changes. `areas` lists the configured areas
//! and `versions` inspects what has been published.
//!
//! Uses `indicatif-log-bridge` (via [`cleanup_map_cli_utils::init_logger`])
//! so that log lines and the tile progress bar never fight for the
//! terminal.

mod areas;
mod versions;

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use cleanup_map_cli_utils::{IndicatifProgress, MultiProgress};
use cleanup_map_geo::registry;
use cleanup_map_geo_models::{MAX_ZOOM, PRIMARY_ZOOM};
use cleanup_map_publish::{
    DEFAULT_CONCURRENCY, EmptyTilePolicy, PublishConfig, ShutdownSignal, VersionPublisher,
};
use cleanup_map_publish_models::{CycleOutcome, RunSummary, Version};
use cleanup_map_r2::{MemoryStore, ObjectStore, R2Client};
use cleanup_map_tracker::{ChangeTracker, UpstashClient};

use crate::areas::ConfigError;

#[derive(Parser)]
#[command(name = "cleanup_map", about = "Incremental map tile publisher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish new tile versions for areas with pending changes
    Publish(PublishArgs),
    /// List configured areas
    Areas {
        /// Also load test areas from the key-value store
        #[arg(long)]
        remote: bool,
    },
    /// Show published versions of an area
    Versions {
        /// Area name
        area: String,
        /// Inspect one tile, given as `x/y`
        #[arg(long)]
        tile: Option<String>,
        /// Version to inspect (defaults to the latest)
        #[arg(long)]
        version: Option<Version>,
        /// Zoom level of `--tile`
        #[arg(long, default_value_t = PRIMARY_ZOOM)]
        zoom: u8,
    },
}

#[derive(Args)]
struct PublishArgs {
    /// Comma-separated areas; `test`, `all_test_areas` and `test_*` select
    /// remote test areas
    #[arg(long, env = "TILE_GENERATION_AREAS", default_value = registry::DEFAULT_AREA)]
    areas: String,

    /// Zoom level to render
    #[arg(long, default_value_t = PRIMARY_ZOOM, value_parser = clap::value_parser!(u8).range(0..=i64::from(MAX_ZOOM)))]
    zoom: u8,

    /// Maximum tiles processed concurrently
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Leave fully transparent tiles out of the new version
    #[arg(long)]
    skip_empty_tiles: bool,

    /// Do not copy unchanged tiles from the previous version
    #[arg(long)]
    no_copy: bool,

    /// Write to an in-memory object store and leave the key-value store
    /// untouched
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = cleanup_map_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Publish(args) => publish(args, &multi).await,
        Commands::Areas { remote } => list_areas(remote).await,
        Commands::Versions {
            area,
            tile,
            version,
            zoom,
        } => {
            let store = R2Client::from_env().map_err(ConfigError::from)?;
            match tile {
                Some(fragment) => {
                    versions::inspect_tile(&store, &area, version, &fragment, zoom).await
                }
                None => versions::list(&store, &area).await,
            }
        }
    }
}

fn tracker_from_env() -> Result<ChangeTracker, ConfigError> {
    Ok(ChangeTracker::new(Arc::new(UpstashClient::from_env()?)))
}

async fn publish(args: PublishArgs, multi: &MultiProgress) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = tracker_from_env()?;
    let store: Arc<dyn ObjectStore> = if args.dry_run {
        log::warn!("Dry run: tiles go to an in-memory store and nothing is announced");
        Arc::new(MemoryStore::new())
    } else {
        let client = R2Client::from_env().map_err(ConfigError::from)?;
        log::info!("Publishing to bucket {}", client.bucket());
        Arc::new(client)
    };

    let areas = areas::select_areas(&args.areas, &tracker).await?;

    let config = PublishConfig {
        zoom: args.zoom,
        concurrency: args.concurrency.max(1),
        copy_unchanged: !args.no_copy,
        empty_tiles: if args.skip_empty_tiles {
            EmptyTilePolicy::Skip
        } else {
            EmptyTilePolicy::Upload
        },
        commit: !args.dry_run,
        ..PublishConfig::default()
    };
    log::info!(
        "Publishing at zoom {} with concurrency {} (copy unchanged: {}, empty tiles: {:?})",
        config.zoom,
        config.concurrency,
        config.copy_unchanged,
        config.empty_tiles
    );

    let shutdown = ShutdownSignal::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, finishing in-flight tiles");
            on_signal.trigger();
        }
    });

    let publisher = VersionPublisher::new(store, tracker, config)
        .with_shutdown(shutdown)
        .with_progress(IndicatifProgress::tiles_bar(multi, "Publishing"));

    let summary = publisher.publish_all(&areas).await;
    print_summary(&summary);

    if summary.is_success() {
        Ok(())
    } else {
        Err(format!("{} area(s) failed to publish", summary.failed()).into())
    }
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.reports {
        let outcome = match &report.outcome {
            CycleOutcome::NoChanges => "no changes".to_string(),
            CycleOutcome::NoTilesToUpdate => "no tiles to update".to_string(),
            CycleOutcome::Published { version } => format!("published {version}"),
            CycleOutcome::Failed { stage, reason } => format!("FAILED at {stage}: {reason}"),
        };
        println!(
            "{:<16} {outcome} ({} rendered, {} copied, {} tile failure(s), {:.1}s)",
            report.area,
            report.stats.tiles_processed,
            report.stats.tiles_copied,
            report.failures.len(),
            report.elapsed.as_secs_f64()
        );
    }
}

async fn list_areas(remote: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut all = registry::all_areas();
    if remote {
        all.extend(tracker_from_env()?.fetch_remote_areas().await?);
    }

    for area in &all {
        let [min_lng, min_lat, max_lng, max_lat] = area.bounds.as_lng_lat_array();
        println!(
            "{:<16} {}  [{min_lng:.5}, {min_lat:.5}, {max_lng:.5}, {max_lat:.5}]",
            area.name, area.display_name
        );
    }

    Ok(())
}

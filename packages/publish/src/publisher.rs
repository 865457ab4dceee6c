//! The per-area publish cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use cleanup_map_geo::resolver::{ResolvedChangeSet, resolve};
use cleanup_map_geo_models::{AreaConfig, GeoKey, PointState, TileAddress};
use cleanup_map_publish_models::keys::{
    self, JSON_CONTENT_TYPE, MUTABLE_CACHE_CONTROL, PNG_CONTENT_TYPE, VERSIONED_CACHE_CONTROL,
};
use cleanup_map_publish_models::{
    CycleOutcome, CycleReport, CycleStats, GenerationStats, PublishStage, RunSummary, TileFailure,
    TileOperation, Version, VersionIndex,
};
use cleanup_map_r2::ObjectStore;
use cleanup_map_raster::RasterMergeEngine;
use cleanup_map_tracker::ChangeTracker;
use futures::stream::{self, StreamExt as _};
use serde::Serialize;

use crate::progress::{ProgressCallback, null_progress};
use crate::{EmptyTilePolicy, PublishConfig, PublishError, ShutdownSignal, metadata};

/// Identity of the cycle in progress.
#[derive(Debug, Clone, Copy)]
struct CycleContext<'a> {
    area: &'a str,
    previous: Option<Version>,
    version: Version,
}

#[derive(Debug, Default)]
struct TileCounters {
    processed: AtomicU64,
    skipped_empty: AtomicU64,
    downloaded: AtomicU64,
    copied: AtomicU64,
    bytes_uploaded: AtomicU64,
    foreign_pixels: AtomicU64,
    discarded_rasters: AtomicU64,
}

impl TileCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn apply(&self, stats: &mut CycleStats) {
        stats.tiles_processed = self.processed.load(Ordering::Relaxed);
        stats.tiles_skipped_empty = self.skipped_empty.load(Ordering::Relaxed);
        stats.tiles_downloaded = self.downloaded.load(Ordering::Relaxed);
        stats.tiles_copied = self.copied.load(Ordering::Relaxed);
        stats.bytes_uploaded = self.bytes_uploaded.load(Ordering::Relaxed);
        stats.foreign_pixels = self.foreign_pixels.load(Ordering::Relaxed);
        stats.discarded_rasters = self.discarded_rasters.load(Ordering::Relaxed);
    }
}

/// Result of one tile task.
#[derive(Debug)]
enum TileOutcome {
    /// The tile exists in the new version.
    Stored(TileAddress),
    /// The merged tile was transparent and left out.
    SkippedEmpty,
    Failed(TileFailure),
    /// Shutdown was requested before the task started.
    Interrupted,
}

#[derive(Debug, Default)]
struct Tally {
    attempted: usize,
    failed: usize,
    interrupted: usize,
}

impl Tally {
    fn collect(
        outcomes: Vec<TileOutcome>,
        present: &mut BTreeSet<TileAddress>,
        failures: &mut Vec<TileFailure>,
    ) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            match outcome {
                TileOutcome::Stored(tile) => {
                    tally.attempted += 1;
                    present.insert(tile);
                }
                TileOutcome::SkippedEmpty => tally.attempted += 1,
                TileOutcome::Failed(failure) => {
                    tally.attempted += 1;
                    tally.failed += 1;
                    failures.push(failure);
                }
                TileOutcome::Interrupted => tally.interrupted += 1,
            }
        }
        tally
    }
}

fn failed(stage: PublishStage, reason: impl Into<String>) -> CycleOutcome {
    CycleOutcome::Failed {
        stage,
        reason: reason.into(),
    }
}

fn tile_failure(tile: TileAddress, operation: TileOperation, error: impl Display) -> TileOutcome {
    log::warn!("Tile {tile}: {operation} failed: {error}");
    TileOutcome::Failed(TileFailure {
        tile,
        operation,
        reason: error.to_string(),
    })
}

/// Publishes new tile versions for areas with pending changes.
pub struct VersionPublisher {
    store: Arc<dyn ObjectStore>,
    tracker: ChangeTracker,
    engine: RasterMergeEngine,
    config: PublishConfig,
    shutdown: ShutdownSignal,
    progress: Arc<dyn ProgressCallback>,
}

impl VersionPublisher {
    /// Creates a publisher painting with the configured palette, no progress
    /// reporting and a fresh [`ShutdownSignal`].
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, tracker: ChangeTracker, config: PublishConfig) -> Self {
        Self {
            store,
            tracker,
            engine: RasterMergeEngine::new(config.palette),
            config,
            shutdown: ShutdownSignal::new(),
            progress: null_progress(),
        }
    }

    /// Uses `shutdown` to stop early.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Reports tile progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs one cycle per area, in order. Stops starting new areas once
    /// shutdown is requested.
    pub async fn publish_all(&self, areas: &[AreaConfig]) -> RunSummary {
        let mut summary = RunSummary::default();

        for (i, area) in areas.iter().enumerate() {
            if self.shutdown.is_triggered() {
                log::warn!(
                    "Shutdown requested, skipping {} remaining area(s)",
                    areas.len() - i
                );
                break;
            }
            log::info!("[{}/{}] Publishing {}", i + 1, areas.len(), area.name);
            summary.reports.push(self.publish_area(area).await);
        }

        log::info!(
            "Run finished: {} area(s), {} published, {} failed",
            summary.reports.len(),
            summary.published(),
            summary.failed()
        );

        summary
    }

    /// Runs a full publish cycle for `area`.
    ///
    /// Never fails: errors end the cycle early and are described by the
    /// returned report's outcome.
    pub async fn publish_area(&self, area: &AreaConfig) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::new(&area.name);

        let outcome = self.run_cycle(area, &mut report).await;
        report.outcome = outcome;
        report.elapsed = start.elapsed();

        let name = &area.name;
        match &report.outcome {
            CycleOutcome::NoChanges => log::info!("{name}: no pending changes"),
            CycleOutcome::NoTilesToUpdate => {
                log::info!("{name}: no changed points inside the area, nothing to render");
            }
            CycleOutcome::Published { version } => log::info!(
                "{name}: published version {version} in {:.1}s ({} rendered, {} copied, {} failed)",
                report.elapsed.as_secs_f64(),
                report.stats.tiles_processed,
                report.stats.tiles_copied,
                report.failures.len()
            ),
            CycleOutcome::Failed { stage, reason } => {
                log::error!("{name}: cycle failed at {stage}: {reason}");
            }
        }

        report
    }

    #[allow(clippy::too_many_lines)]
    async fn run_cycle(&self, area: &AreaConfig, report: &mut CycleReport) -> CycleOutcome {
        let name = area.name.as_str();

        let pending = match self.tracker.pending_changes(name).await {
            Ok(pending) => pending,
            Err(e) => {
                return failed(
                    PublishStage::ChangesetRead,
                    format!("Failed to read change set: {e}"),
                );
            }
        };
        report.reach(PublishStage::ChangesetRead);
        report.stats.pending_keys = pending.len();

        if pending.is_empty() {
            return CycleOutcome::NoChanges;
        }

        let resolved = resolve(&pending, &area.bounds, self.config.zoom);
        report.stats.unparseable_keys = resolved.unparseable;
        report.stats.out_of_bounds_keys = resolved.out_of_bounds;
        report.stats.affected_tiles = resolved.tile_count();

        if resolved.is_empty() {
            report.reach(PublishStage::TilesResolved);
            report.changeset_cleared = self.clear_changes(name).await;
            if report.changeset_cleared {
                report.reach(PublishStage::ChangesetCleared);
            }
            return CycleOutcome::NoTilesToUpdate;
        }

        let states = match self
            .tracker
            .point_states(name, &resolved.retained_keys())
            .await
        {
            Ok(states) => states,
            Err(e) => {
                return failed(
                    PublishStage::TilesResolved,
                    format!("Failed to read point states: {e}"),
                );
            }
        };
        report.reach(PublishStage::TilesResolved);

        let previous = match self.previous_version(name).await {
            Ok(previous) => previous,
            Err(e) => {
                return failed(
                    PublishStage::TilesMerged,
                    format!("Failed to determine the previous version: {e}"),
                );
            }
        };
        report.previous_version = previous;

        let version = Version::allocate(Version::now_secs(), previous);
        log::info!(
            "{name}: rendering {} tile(s) for version {version} (previous: {})",
            resolved.tile_count(),
            previous.map_or_else(|| "none".to_string(), |v| v.to_string())
        );

        let ctx = CycleContext {
            area: name,
            previous,
            version,
        };
        let counters = TileCounters::default();
        let tile_start = Instant::now();
        let mut present = BTreeSet::new();

        let outcomes = self.render_tiles(&ctx, &resolved, &states, &counters).await;
        let rendered = Tally::collect(outcomes, &mut present, &mut report.failures);
        counters.apply(&mut report.stats);

        if rendered.interrupted > 0 {
            return failed(
                PublishStage::TilesUploaded,
                format!(
                    "interrupted with {} tile(s) not rendered",
                    rendered.interrupted
                ),
            );
        }
        if rendered.attempted > 0 && rendered.failed == rendered.attempted {
            return failed(
                PublishStage::TilesUploaded,
                format!("all {} affected tile(s) failed", rendered.failed),
            );
        }
        report.reach(PublishStage::TilesMerged);

        let failed_tiles: BTreeSet<TileAddress> = report.failures.iter().map(|f| f.tile).collect();
        if self.config.copy_unchanged || !failed_tiles.is_empty() {
            let outcomes = match self
                .carry_forward(&ctx, &resolved, &failed_tiles, &counters)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    return failed(
                        PublishStage::TilesUploaded,
                        format!("Failed to list tiles of the previous version: {e}"),
                    );
                }
            };
            let copied = Tally::collect(outcomes, &mut present, &mut report.failures);
            counters.apply(&mut report.stats);

            if copied.interrupted > 0 {
                return failed(
                    PublishStage::TilesUploaded,
                    format!(
                        "interrupted with {} unchanged tile(s) not copied",
                        copied.interrupted
                    ),
                );
            }
        }
        report.reach(PublishStage::TilesUploaded);
        self.progress
            .finish(format!("{name}: {} tile(s) in version {version}", present.len()));

        let generation_stats = GenerationStats {
            tiles_processed: report.stats.tiles_processed,
            tiles_copied: report.stats.tiles_copied,
            tiles_downloaded: report.stats.tiles_downloaded,
            bytes_uploaded: report.stats.bytes_uploaded,
            execution_time_seconds: tile_start.elapsed().as_secs_f64(),
        };

        if let Err(e) = self
            .publish_metadata(area, &ctx, &resolved, &states, &present, generation_stats)
            .await
        {
            log::error!(
                "{name}: tiles for version {version} were uploaded but its metadata was not \
                 published; the version is orphaned: {e}"
            );
            return failed(PublishStage::MetadataPublished, e.to_string());
        }
        report.reach(PublishStage::MetadataPublished);

        if report.failures.is_empty() {
            report.changeset_cleared = self.clear_changes(name).await;
            if report.changeset_cleared {
                report.reach(PublishStage::ChangesetCleared);
            }
        } else {
            log::warn!(
                "{name}: keeping the change set, {} tile(s) failed and will be rendered again \
                 next run",
                report.failures.len()
            );
        }

        CycleOutcome::Published { version }
    }

    /// The announced version, or the newest version prefix in the store.
    async fn previous_version(&self, area: &str) -> Result<Option<Version>, PublishError> {
        if let Some(seconds) = self.tracker.latest_version(area).await? {
            return Ok(Some(Version::new(seconds)));
        }

        let children = self
            .store
            .list_child_prefixes(&keys::area_prefix(area))
            .await?;
        let newest = children
            .iter()
            .filter_map(|segment| segment.parse::<Version>().ok())
            .max();

        if let Some(version) = newest {
            log::info!("{area}: no announced version, using newest stored version {version}");
        }
        Ok(newest)
    }

    async fn render_tiles(
        &self,
        ctx: &CycleContext<'_>,
        resolved: &ResolvedChangeSet,
        states: &BTreeMap<GeoKey, PointState>,
        counters: &TileCounters,
    ) -> Vec<TileOutcome> {
        let work: Vec<(TileAddress, BTreeMap<GeoKey, PointState>)> = resolved
            .by_tile
            .iter()
            .map(|(tile, tile_keys)| {
                let tile_states = tile_keys
                    .iter()
                    .filter_map(|key| states.get(key).map(|state| (key.clone(), *state)))
                    .collect();
                (*tile, tile_states)
            })
            .collect();

        self.progress
            .set_message(format!("{}: rendering tiles", ctx.area));
        self.progress.set_total(work.len() as u64);

        stream::iter(
            work.iter()
                .map(|(tile, tile_states)| self.render_tile(ctx, *tile, tile_states, counters)),
        )
        .buffer_unordered(self.config.concurrency.max(1))
        .collect()
        .await
    }

    async fn render_tile(
        &self,
        ctx: &CycleContext<'_>,
        tile: TileAddress,
        states: &BTreeMap<GeoKey, PointState>,
        counters: &TileCounters,
    ) -> TileOutcome {
        if self.shutdown.is_triggered() {
            return TileOutcome::Interrupted;
        }

        let existing = match ctx.previous {
            Some(previous) => match self.store.get(&keys::tile(ctx.area, previous, &tile)).await {
                Ok(bytes) => {
                    if bytes.is_some() {
                        TileCounters::bump(&counters.downloaded, 1);
                    }
                    bytes
                }
                Err(e) => {
                    self.progress.inc(1);
                    return tile_failure(tile, TileOperation::Download, e);
                }
            },
            None => None,
        };

        let outcome = self.merge_and_upload(ctx, tile, existing, states, counters).await;
        self.progress.inc(1);
        outcome
    }

    async fn merge_and_upload(
        &self,
        ctx: &CycleContext<'_>,
        tile: TileAddress,
        existing: Option<Vec<u8>>,
        states: &BTreeMap<GeoKey, PointState>,
        counters: &TileCounters,
    ) -> TileOutcome {
        let merged = match self.engine.merge(&tile, existing.as_deref(), states) {
            Ok(merged) => merged,
            Err(e) => return tile_failure(tile, TileOperation::Merge, e),
        };

        TileCounters::bump(&counters.foreign_pixels, merged.stats.foreign_pixels as u64);
        if merged.stats.existing_discarded {
            TileCounters::bump(&counters.discarded_rasters, 1);
        }

        if merged.is_transparent() && self.config.empty_tiles == EmptyTilePolicy::Skip {
            log::debug!("Tile {tile}: transparent after merge, skipping");
            TileCounters::bump(&counters.skipped_empty, 1);
            return TileOutcome::SkippedEmpty;
        }

        let size = merged.png.len() as u64;
        let key = keys::tile(ctx.area, ctx.version, &tile);
        match self
            .store
            .put(&key, merged.png, PNG_CONTENT_TYPE, VERSIONED_CACHE_CONTROL)
            .await
        {
            Ok(()) => {
                TileCounters::bump(&counters.processed, 1);
                TileCounters::bump(&counters.bytes_uploaded, size);
                TileOutcome::Stored(tile)
            }
            Err(e) => tile_failure(tile, TileOperation::Upload, e),
        }
    }

    /// Copies tiles of the previous version into the new one: every tile
    /// that was not re-rendered (when `copy_unchanged` is set) and every
    /// affected tile whose render failed, so its previous pixels survive.
    async fn carry_forward(
        &self,
        ctx: &CycleContext<'_>,
        resolved: &ResolvedChangeSet,
        failed_tiles: &BTreeSet<TileAddress>,
        counters: &TileCounters,
    ) -> Result<Vec<TileOutcome>, PublishError> {
        let Some(previous) = ctx.previous else {
            return Ok(Vec::new());
        };

        let zoom = self.config.zoom;
        let prefix = keys::zoom_prefix(ctx.area, previous, zoom);
        let unchanged: Vec<TileAddress> = self
            .store
            .list_by_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|key| keys::parse_tile(&prefix, zoom, key))
            .filter(|tile| {
                if resolved.by_tile.contains_key(tile) {
                    failed_tiles.contains(tile)
                } else {
                    self.config.copy_unchanged
                }
            })
            .collect();

        if !failed_tiles.is_empty() {
            log::warn!(
                "{}: keeping version {previous} of {} failed tile(s)",
                ctx.area,
                failed_tiles.len()
            );
        }
        log::info!(
            "{}: copying {} tile(s) from version {previous}",
            ctx.area,
            unchanged.len()
        );
        self.progress
            .set_message(format!("{}: copying unchanged tiles", ctx.area));
        self.progress.set_total(unchanged.len() as u64);

        Ok(stream::iter(
            unchanged
                .into_iter()
                .map(|tile| self.copy_tile(ctx, previous, tile, counters)),
        )
        .buffer_unordered(self.config.concurrency.max(1))
        .collect()
        .await)
    }

    async fn copy_tile(
        &self,
        ctx: &CycleContext<'_>,
        previous: Version,
        tile: TileAddress,
        counters: &TileCounters,
    ) -> TileOutcome {
        if self.shutdown.is_triggered() {
            return TileOutcome::Interrupted;
        }

        let result = self
            .store
            .copy(
                &keys::tile(ctx.area, previous, &tile),
                &keys::tile(ctx.area, ctx.version, &tile),
            )
            .await;
        self.progress.inc(1);

        match result {
            Ok(()) => {
                TileCounters::bump(&counters.copied, 1);
                TileOutcome::Stored(tile)
            }
            Err(e) => tile_failure(tile, TileOperation::Copy, e),
        }
    }

    /// Writes the version, coverage, tileset and index documents, then
    /// announces the version.
    async fn publish_metadata(
        &self,
        area: &AreaConfig,
        ctx: &CycleContext<'_>,
        resolved: &ResolvedChangeSet,
        states: &BTreeMap<GeoKey, PointState>,
        present: &BTreeSet<TileAddress>,
        generation_stats: GenerationStats,
    ) -> Result<(), PublishError> {
        let name = ctx.area;
        let version = ctx.version;
        let zoom = self.config.zoom;

        let descriptor = metadata::version_descriptor(
            area,
            &self.config,
            version,
            metadata::version_coverage(resolved, states),
            generation_stats,
        );
        self.put_json(
            &keys::version_metadata(name, version),
            &descriptor,
            "version descriptor",
            VERSIONED_CACHE_CONTROL,
        )
        .await?;

        let coverage = metadata::coverage_descriptor(area, zoom, present);
        self.put_json(
            &keys::coverage(name, version, zoom),
            &coverage,
            "coverage descriptor",
            VERSIONED_CACHE_CONTROL,
        )
        .await?;

        let tileset = metadata::tileset_descriptor(area, &self.config, version);
        self.put_json(
            &keys::tileset(name),
            &tileset,
            "tileset descriptor",
            MUTABLE_CACHE_CONTROL,
        )
        .await?;

        let mut index = self.load_version_index(name).await?;
        index.insert(version);
        self.put_json(
            &keys::version_index(name),
            &index,
            "version index",
            MUTABLE_CACHE_CONTROL,
        )
        .await?;

        if self.config.commit {
            self.tracker
                .set_latest_version(name, version.as_secs())
                .await?;
        } else {
            log::info!("{name}: not announcing version {version} (commit disabled)");
        }

        Ok(())
    }

    /// Reads the version index, rebuilding it from the stored version
    /// prefixes if it is missing or unreadable. Only versions whose version
    /// descriptor exists are listed; orphans of a failed metadata publish
    /// are left out.
    async fn load_version_index(&self, area: &str) -> Result<VersionIndex, PublishError> {
        match self.store.get(&keys::version_index(area)).await? {
            Some(bytes) => match serde_json::from_slice::<VersionIndex>(&bytes) {
                Ok(index) => return Ok(index),
                Err(e) => log::warn!("{area}: version index is unreadable, rebuilding: {e}"),
            },
            None => log::info!("{area}: no version index yet, creating one"),
        }

        let children = self
            .store
            .list_child_prefixes(&keys::area_prefix(area))
            .await?;

        let candidates = children
            .iter()
            .filter_map(|segment| segment.parse::<Version>().ok());

        let mut versions = Vec::new();
        for version in candidates {
            if self
                .store
                .get(&keys::version_metadata(area, version))
                .await?
                .is_some()
            {
                versions.push(version);
            } else {
                log::warn!("{area}: version {version} has no metadata, leaving it out of the index");
            }
        }

        Ok(VersionIndex::from_versions(versions))
    }

    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        document: &'static str,
        cache_control: &str,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec_pretty(value)
            .map_err(|source| PublishError::Serialize { document, source })?;
        self.store
            .put(key, body, JSON_CONTENT_TYPE, cache_control)
            .await?;
        log::debug!("Wrote {document} to {key}");
        Ok(())
    }

    /// Deletes the change set. Returns whether it was deleted.
    async fn clear_changes(&self, area: &str) -> bool {
        if !self.config.commit {
            log::info!("{area}: leaving change set in place (commit disabled)");
            return false;
        }

        match self.tracker.clear(area).await {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "{area}: failed to clear the change set; these changes will be rendered again \
                     next run: {e}"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cleanup_map_geo::projection::tile_address;
    use cleanup_map_geo_models::{AreaBounds, GeoPoint, PRIMARY_ZOOM};
    use cleanup_map_publish_models::{CoverageDescriptor, TilesetDescriptor, VersionDescriptor};
    use cleanup_map_r2::{FailOn, MemoryStore};
    use cleanup_map_raster::{Palette, decode_states};
    use cleanup_map_tracker::{KeyValueStore as _, MemoryKeyValueStore};

    use super::*;

    const AREA: &str = "guangfu";
    const POINT_A: &str = "23.6677_121.4370";
    const POINT_A_NEIGHBOUR: &str = "23.6677_121.4371";
    const POINT_B: &str = "23.6600_121.4300";
    const POINT_C: &str = "23.6550_121.4200";
    const OUTSIDE: &str = "25.0000_121.5000";

    struct Harness {
        store: Arc<MemoryStore>,
        kv: Arc<MemoryKeyValueStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                kv: Arc::new(MemoryKeyValueStore::new()),
            }
        }

        fn publisher(&self, config: PublishConfig) -> VersionPublisher {
            VersionPublisher::new(
                self.store.clone(),
                ChangeTracker::new(self.kv.clone()),
                config,
            )
        }

        fn report(&self, key: &str, clear: &str, muddy: &str) {
            self.kv.add_members(&format!("changed_coords:{AREA}"), [key]);
            let hash = format!("geo:{AREA}:{key}");
            self.kv.set_hash_field(&hash, "Score_0", clear);
            self.kv.set_hash_field(&hash, "Score_1", muddy);
        }

        fn pending(&self) -> bool {
            self.kv.contains_key(&format!("changed_coords:{AREA}"))
        }

        fn tile_states(&self, version: Version, key: &str) -> BTreeMap<(u32, u32), PointState> {
            let point = GeoKey::from(key).parse().unwrap();
            let tile = tile_address(point.lat, point.lon, PRIMARY_ZOOM);
            let object = self.store.object(&keys::tile(AREA, version, &tile)).unwrap();
            decode_states(&object.body, &Palette::default()).unwrap()
        }

        fn json<T: serde::de::DeserializeOwned>(&self, key: &str) -> T {
            serde_json::from_slice(&self.store.object(key).unwrap().body).unwrap()
        }
    }

    fn area() -> AreaConfig {
        AreaConfig {
            name: AREA.to_string(),
            display_name: "花蓮光復鄉".to_string(),
            bounds: AreaBounds {
                min_lat: 23.653_96,
                max_lat: 23.681_37,
                min_lng: 121.417_60,
                max_lng: 121.456_57,
            },
            center: GeoPoint::new(23.667_67, 121.437_09),
        }
    }

    fn published(report: &CycleReport) -> Version {
        match report.outcome {
            CycleOutcome::Published { version } => version,
            ref other => panic!("expected a published version, got {other:?}"),
        }
    }

    fn failed_stage(report: &CycleReport) -> PublishStage {
        match report.outcome {
            CycleOutcome::Failed { stage, .. } => stage,
            ref other => panic!("expected a failed cycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_change_set_publishes_nothing() {
        let h = Harness::new();
        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;

        assert_eq!(report.outcome, CycleOutcome::NoChanges);
        assert_eq!(report.stage_reached, PublishStage::ChangesetRead);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn first_publish_renders_and_announces() {
        let h = Harness::new();
        h.report(POINT_A, "0", "2");

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;
        let version = published(&report);

        assert_eq!(report.stage_reached, PublishStage::ChangesetCleared);
        assert!(report.changeset_cleared);
        assert_eq!(report.stats.tiles_processed, 1);
        assert_eq!(report.stats.tiles_copied, 0);
        assert!(!h.pending());

        let states = h.tile_states(version, POINT_A);
        assert_eq!(states.get(&(115, 38)), Some(&PointState::Muddy));
        assert_eq!(states.len(), 1);

        let tile = h
            .store
            .object(&keys::tile(AREA, version, &TileAddress::new(438_999, 226_651, 19)))
            .unwrap();
        assert_eq!(tile.content_type, "image/png");
        assert_eq!(tile.cache_control, "public, max-age=3600");

        let index: VersionIndex = h.json(&keys::version_index(AREA));
        assert_eq!(index.latest_version, Some(version));
        assert_eq!(index.total_versions, 1);
        assert_eq!(
            h.store.object(&keys::version_index(AREA)).unwrap().cache_control,
            "no-cache"
        );

        let descriptor: VersionDescriptor = h.json(&keys::version_metadata(AREA, version));
        assert_eq!(descriptor.coverage.muddy_count, 1);
        assert_eq!(descriptor.coverage.affected_tiles, vec!["438999/226651"]);

        let coverage: CoverageDescriptor = h.json(&keys::coverage(AREA, version, 19));
        assert_eq!(coverage.tiles, vec!["438999/226651"]);

        let tileset: TilesetDescriptor = h.json(&keys::tileset(AREA));
        assert_eq!(tileset.latest_version, version);

        assert_eq!(
            h.kv.get(&format!("tile_version:{AREA}")).await.unwrap(),
            Some(version.to_string())
        );
    }

    #[tokio::test]
    async fn second_publish_merges_and_copies_forward() {
        let h = Harness::new();
        let publisher = h.publisher(PublishConfig::default());

        h.report(POINT_A, "0", "2");
        h.report(POINT_B, "1", "0");
        let first = published(&publisher.publish_area(&area()).await);

        h.report(POINT_A_NEIGHBOUR, "3", "0");
        let report = publisher.publish_area(&area()).await;
        let second = published(&report);

        assert!(second > first);
        assert_eq!(report.previous_version, Some(first));
        assert_eq!(report.stats.tiles_processed, 1);
        assert_eq!(report.stats.tiles_downloaded, 1);
        assert_eq!(report.stats.tiles_copied, 1);

        // Point A survives the merge; its neighbour is painted next to it.
        let states = h.tile_states(second, POINT_A);
        assert_eq!(states.get(&(115, 38)), Some(&PointState::Muddy));
        assert_eq!(states.len(), 2);
        assert!(states.values().any(|s| *s == PointState::Clear));

        // Point B's tile was not touched and is copied byte for byte.
        let b = GeoKey::from(POINT_B).parse().unwrap();
        let b_tile = tile_address(b.lat, b.lon, PRIMARY_ZOOM);
        assert_eq!(
            h.store.object(&keys::tile(AREA, first, &b_tile)).unwrap().body,
            h.store.object(&keys::tile(AREA, second, &b_tile)).unwrap().body
        );

        let index: VersionIndex = h.json(&keys::version_index(AREA));
        let order: Vec<Version> = index.versions.iter().map(|e| e.version).collect();
        assert_eq!(order, vec![second, first]);

        let coverage: CoverageDescriptor = h.json(&keys::coverage(AREA, second, 19));
        assert_eq!(coverage.tile_count, 2);
    }

    #[tokio::test]
    async fn out_of_bounds_changes_are_cleared_without_a_version() {
        let h = Harness::new();
        h.report(OUTSIDE, "0", "1");
        h.kv.add_members(&format!("changed_coords:{AREA}"), ["not-a-key"]);

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;

        assert_eq!(report.outcome, CycleOutcome::NoTilesToUpdate);
        assert!(report.outcome.is_success());
        assert_eq!(report.stats.tiles_processed, 0);
        assert_eq!(report.stats.out_of_bounds_keys, 1);
        assert_eq!(report.stats.unparseable_keys, 1);
        assert!(report.changeset_cleared);
        assert!(!h.pending());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn metadata_failure_keeps_the_change_set() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        h.store.fail(FailOn::Put, keys::tileset(AREA));

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;

        assert_eq!(failed_stage(&report), PublishStage::MetadataPublished);
        assert_eq!(report.stage_reached, PublishStage::TilesUploaded);
        assert!(!report.changeset_cleared);
        assert!(h.pending());
        assert_eq!(h.kv.get(&format!("tile_version:{AREA}")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn one_failed_upload_does_not_stop_the_others() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        h.report(POINT_B, "0", "1");

        // Pin the allocated version so the failing key is known up front.
        h.kv.set_string(&format!("tile_version:{AREA}"), "4000000000");
        let version = Version::new(4_000_000_001);

        let a = GeoKey::from(POINT_A).parse().unwrap();
        let a_tile = tile_address(a.lat, a.lon, PRIMARY_ZOOM);
        h.store.fail(FailOn::Put, keys::tile(AREA, version, &a_tile));

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;
        assert_eq!(published(&report), version);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tile, a_tile);
        assert_eq!(report.failures[0].operation, TileOperation::Upload);
        assert_eq!(report.stats.tiles_processed, 1);

        let coverage: CoverageDescriptor = h.json(&keys::coverage(AREA, version, 19));
        assert_eq!(coverage.tile_count, 1);

        // The failed tile is rendered again next run.
        assert!(!report.changeset_cleared);
        assert_eq!(report.stage_reached, PublishStage::MetadataPublished);
        assert!(h.pending());
    }

    #[tokio::test]
    async fn failed_tile_keeps_its_previous_pixels() {
        let h = Harness::new();
        let publisher = h.publisher(PublishConfig::default());

        h.report(POINT_A, "0", "2");
        h.report(POINT_B, "1", "0");
        let first = published(&publisher.publish_area(&area()).await);

        let a = GeoKey::from(POINT_A).parse().unwrap();
        let a_tile = tile_address(a.lat, a.lon, PRIMARY_ZOOM);
        h.report(POINT_A_NEIGHBOUR, "3", "0");
        h.report(POINT_B, "0", "4");
        h.store.fail(FailOn::Get, keys::tile(AREA, first, &a_tile));

        let report = publisher.publish_area(&area()).await;
        let second = published(&report);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].tile, a_tile);
        assert_eq!(report.failures[0].operation, TileOperation::Download);
        assert_eq!(report.stats.tiles_processed, 1);
        assert_eq!(report.stats.tiles_copied, 1);
        assert!(!report.changeset_cleared);
        assert!(h.pending());

        // A's tile is carried over unchanged instead of vanishing.
        assert_eq!(
            h.store.object(&keys::tile(AREA, first, &a_tile)).unwrap().body,
            h.store.object(&keys::tile(AREA, second, &a_tile)).unwrap().body
        );
        let coverage: CoverageDescriptor = h.json(&keys::coverage(AREA, second, 19));
        assert_eq!(coverage.tile_count, 2);

        h.store.clear_failures();
        let report = publisher.publish_area(&area()).await;
        let third = published(&report);

        assert!(report.failures.is_empty());
        assert!(report.changeset_cleared);
        assert!(!h.pending());

        let states = h.tile_states(third, POINT_A);
        assert_eq!(states.get(&(115, 38)), Some(&PointState::Muddy));
        assert_eq!(states.len(), 2);
        assert_eq!(
            h.tile_states(third, POINT_B).values().collect::<Vec<_>>(),
            vec![&PointState::Muddy]
        );
    }

    #[tokio::test]
    async fn failed_tile_is_carried_forward_without_copying_the_rest() {
        let h = Harness::new();
        let publisher = h.publisher(PublishConfig {
            copy_unchanged: false,
            ..PublishConfig::default()
        });

        h.report(POINT_A, "0", "2");
        h.report(POINT_B, "1", "0");
        let first = published(&publisher.publish_area(&area()).await);

        let a = GeoKey::from(POINT_A).parse().unwrap();
        let a_tile = tile_address(a.lat, a.lon, PRIMARY_ZOOM);
        h.report(POINT_A_NEIGHBOUR, "3", "0");
        h.report(POINT_C, "0", "1");
        h.store.fail(FailOn::Get, keys::tile(AREA, first, &a_tile));

        let report = publisher.publish_area(&area()).await;
        let second = published(&report);

        assert_eq!(report.stats.tiles_processed, 1);
        assert_eq!(report.stats.tiles_copied, 1);
        assert!(h.store.object(&keys::tile(AREA, second, &a_tile)).is_some());

        let b = GeoKey::from(POINT_B).parse().unwrap();
        let b_tile = tile_address(b.lat, b.lon, PRIMARY_ZOOM);
        assert!(h.store.object(&keys::tile(AREA, second, &b_tile)).is_none());
    }

    #[tokio::test]
    async fn rebuilt_index_leaves_out_orphaned_versions() {
        let h = Harness::new();
        let publisher = h.publisher(PublishConfig::default());

        h.report(POINT_A, "0", "1");
        let first = published(&publisher.publish_area(&area()).await);

        // Tiles of a version whose metadata never landed.
        let orphan = Version::new(1_000);
        h.store
            .put(
                &keys::tile(AREA, orphan, &TileAddress::new(438_999, 226_651, 19)),
                vec![0],
                PNG_CONTENT_TYPE,
                VERSIONED_CACHE_CONTROL,
            )
            .await
            .unwrap();
        h.store
            .put(
                &keys::version_index(AREA),
                b"not json".to_vec(),
                JSON_CONTENT_TYPE,
                MUTABLE_CACHE_CONTROL,
            )
            .await
            .unwrap();

        h.report(POINT_B, "0", "1");
        let second = published(&publisher.publish_area(&area()).await);

        let index: VersionIndex = h.json(&keys::version_index(AREA));
        let order: Vec<Version> = index.versions.iter().map(|e| e.version).collect();
        assert_eq!(order, vec![second, first]);
    }

    #[tokio::test]
    async fn tiles_are_painted_with_the_configured_palette() {
        let h = Harness::new();
        let palette = Palette::new([10, 20, 30, 255], [40, 50, 60, 255]).unwrap();
        h.report(POINT_A, "0", "1");

        let report = h
            .publisher(PublishConfig {
                palette,
                ..PublishConfig::default()
            })
            .publish_area(&area())
            .await;
        let version = published(&report);

        let tile = TileAddress::new(438_999, 226_651, 19);
        let png = h.store.object(&keys::tile(AREA, version, &tile)).unwrap().body;
        let states = decode_states(&png, &palette).unwrap();
        assert_eq!(states.get(&(115, 38)), Some(&PointState::Muddy));
        assert!(decode_states(&png, &Palette::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_uploads_failing_fails_the_cycle() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        h.store.fail(FailOn::Put, format!("{AREA}/"));

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;

        assert_eq!(failed_stage(&report), PublishStage::TilesUploaded);
        assert_eq!(report.failures.len(), 1);
        assert!(h.pending());
    }

    #[tokio::test]
    async fn shutdown_stops_before_metadata() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let report = h
            .publisher(PublishConfig::default())
            .with_shutdown(shutdown)
            .publish_area(&area())
            .await;

        assert_eq!(failed_stage(&report), PublishStage::TilesUploaded);
        assert!(matches!(
            &report.outcome,
            CycleOutcome::Failed { reason, .. } if reason.starts_with("interrupted")
        ));
        assert!(h.pending());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn skipped_empty_tiles_disappear_from_the_new_version() {
        let h = Harness::new();
        let config = PublishConfig {
            empty_tiles: EmptyTilePolicy::Skip,
            ..PublishConfig::default()
        };
        let publisher = h.publisher(config);

        h.report(POINT_A, "0", "1");
        h.report(POINT_B, "0", "1");
        let first = published(&publisher.publish_area(&area()).await);

        // A's scores vanish: the point becomes undefined and its tile empty.
        h.kv.add_members(&format!("changed_coords:{AREA}"), [POINT_A]);
        h.kv.delete(&format!("geo:{AREA}:{POINT_A}")).await.unwrap();
        let report = publisher.publish_area(&area()).await;
        let second = published(&report);

        assert_eq!(report.stats.tiles_skipped_empty, 1);
        assert_eq!(report.stats.tiles_copied, 1);

        let coverage: CoverageDescriptor = h.json(&keys::coverage(AREA, second, 19));
        assert_eq!(coverage.tile_count, 1);
        let a = GeoKey::from(POINT_A).parse().unwrap();
        let a_tile = tile_address(a.lat, a.lon, PRIMARY_ZOOM);
        assert!(h.store.object(&keys::tile(AREA, first, &a_tile)).is_some());
        assert!(h.store.object(&keys::tile(AREA, second, &a_tile)).is_none());
    }

    #[tokio::test]
    async fn previous_version_falls_back_to_store_listing() {
        let h = Harness::new();
        let publisher = h.publisher(PublishConfig::default());
        h.report(POINT_B, "0", "1");
        let first = published(&publisher.publish_area(&area()).await);

        h.kv.delete(&format!("tile_version:{AREA}")).await.unwrap();
        h.report(POINT_A, "0", "1");
        let report = publisher.publish_area(&area()).await;

        assert_eq!(report.previous_version, Some(first));
        assert_eq!(report.stats.tiles_copied, 1);
    }

    #[tokio::test]
    async fn unreadable_change_set_fails_early() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        h.kv.fail_command("SMEMBERS");

        let report = h.publisher(PublishConfig::default()).publish_area(&area()).await;

        assert_eq!(failed_stage(&report), PublishStage::ChangesetRead);
        assert_eq!(report.stage_reached, PublishStage::Idle);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn uncommitted_run_leaves_the_key_value_store_alone() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        let config = PublishConfig {
            commit: false,
            ..PublishConfig::default()
        };

        let report = h.publisher(config).publish_area(&area()).await;

        published(&report);
        assert!(!report.changeset_cleared);
        assert_eq!(report.stage_reached, PublishStage::MetadataPublished);
        assert!(h.pending());
        assert_eq!(h.kv.get(&format!("tile_version:{AREA}")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_all_runs_every_area() {
        let h = Harness::new();
        h.report(POINT_A, "0", "1");
        let mut other = area();
        other.name = "preview".to_string();

        let summary = h
            .publisher(PublishConfig::default())
            .publish_all(&[area(), other])
            .await;

        assert_eq!(summary.reports.len(), 2);
        assert_eq!(summary.published(), 1);
        assert_eq!(summary.reports[1].outcome, CycleOutcome::NoChanges);
        assert!(summary.is_success());
    }
}

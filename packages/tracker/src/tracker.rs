//! Typed change-set operations over a [`KeyValueStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::Engine as _;
use cleanup_map_geo_models::{AreaConfig, AreaCorners, GeoKey, GeoPoint, PointState};
use serde::Deserialize;

use crate::{KeyValueStore, TrackerError};

/// Hash field holding the accumulated "clear" trust score.
pub const CLEAR_SCORE_FIELD: &str = "Score_0";

/// Hash field holding the accumulated "muddy" trust score.
pub const MUDDY_SCORE_FIELD: &str = "Score_1";

const TEST_AREA_LIST_KEY: &str = "test_areas:list";

fn changed_key(area: &str) -> String {
    format!("changed_coords:{area}")
}

fn point_key(area: &str, key: &GeoKey) -> String {
    format!("geo:{area}:{key}")
}

fn version_key(area: &str) -> String {
    format!("tile_version:{area}")
}

/// Remote test-area definition as stored by the reporting frontend.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteArea {
    #[serde(default)]
    display_name: Option<String>,
    bounds: AreaCorners,
    #[serde(default)]
    center: Option<GeoPoint>,
}

/// Reads and clears pending changes for an area.
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn KeyValueStore>,
}

impl ChangeTracker {
    /// Wraps a key-value store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns every key in the area's change set.
    ///
    /// Keys are returned verbatim, including malformed ones.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the store cannot be read.
    pub async fn pending_changes(&self, area: &str) -> Result<BTreeSet<GeoKey>, TrackerError> {
        let members = self.store.members_of(&changed_key(area)).await?;
        log::info!("{area}: {} changed point(s) pending", members.len());
        Ok(members.into_iter().map(GeoKey::from_raw).collect())
    }

    /// Reads the current state of each key from its trust scores.
    ///
    /// Score strings that are not numbers count as missing.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the store cannot be read.
    pub async fn point_states(
        &self,
        area: &str,
        keys: &BTreeSet<GeoKey>,
    ) -> Result<BTreeMap<GeoKey, PointState>, TrackerError> {
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }

        let hash_keys: Vec<String> = keys.iter().map(|k| point_key(area, k)).collect();
        let replies = self
            .store
            .hash_fields_of_many(&hash_keys, &[CLEAR_SCORE_FIELD, MUDDY_SCORE_FIELD])
            .await?;

        let mut states = BTreeMap::new();
        for (key, fields) in keys.iter().zip(replies) {
            let score = |index: usize| {
                fields.get(index).cloned().flatten().and_then(|raw| {
                    raw.trim().parse::<f64>().map_or_else(
                        |_| {
                            log::warn!("{area}: ignoring non-numeric score '{raw}' for {key}");
                            None
                        },
                        Some,
                    )
                })
            };
            states.insert(key.clone(), PointState::from_scores(score(0), score(1)));
        }

        let count = |s: PointState| states.values().filter(|v| **v == s).count();
        log::info!(
            "{area}: {} clear, {} muddy, {} undefined",
            count(PointState::Clear),
            count(PointState::Muddy),
            count(PointState::Undefined)
        );

        Ok(states)
    }

    /// Deletes the area's change set.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the delete fails.
    pub async fn clear(&self, area: &str) -> Result<(), TrackerError> {
        let removed = self.store.delete(&changed_key(area)).await?;
        log::info!("{area}: change set cleared (existed: {removed})");
        Ok(())
    }

    /// Returns the latest announced version for the area.
    ///
    /// A stored value that is not a decimal integer is logged and treated as
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the store cannot be read.
    pub async fn latest_version(&self, area: &str) -> Result<Option<u64>, TrackerError> {
        let Some(raw) = self.store.get(&version_key(area)).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(version) => Ok(Some(version)),
            Err(_) => {
                log::warn!("{area}: ignoring malformed tile version '{raw}'");
                Ok(None)
            }
        }
    }

    /// Announces `version` as the area's latest.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the write fails.
    pub async fn set_latest_version(&self, area: &str, version: u64) -> Result<(), TrackerError> {
        self.store
            .set(&version_key(area), &version.to_string())
            .await
    }

    /// Loads every test area registered by the frontend.
    ///
    /// Entries that are missing or fail to decode are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] if the list of ids cannot be read.
    pub async fn fetch_remote_areas(&self) -> Result<Vec<AreaConfig>, TrackerError> {
        let ids = self.store.members_of(TEST_AREA_LIST_KEY).await?;
        log::info!("Found {} remote test area(s)", ids.len());

        let mut areas = Vec::with_capacity(ids.len());
        for id in ids {
            let raw = match self.store.get(&format!("test_areas:{id}")).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    log::warn!("Test area {id} is listed but has no definition, skipping");
                    continue;
                }
                Err(e) => {
                    log::warn!("Failed to load test area {id}: {e}");
                    continue;
                }
            };

            match decode_remote_area(&id, &raw) {
                Ok(area) => {
                    log::info!("Loaded test area {id} ({})", area.display_name);
                    areas.push(area);
                }
                Err(message) => log::warn!("Failed to decode test area {id}: {message}"),
            }
        }

        Ok(areas)
    }
}

/// Decodes a base64 JSON test-area definition.
fn decode_remote_area(id: &str, raw: &str) -> Result<AreaConfig, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| format!("invalid base64: {e}"))?;
    let remote: RemoteArea =
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {e}"))?;

    let bounds = remote.bounds.to_bounds();
    Ok(AreaConfig {
        name: id.to_string(),
        display_name: remote
            .display_name
            .unwrap_or_else(|| format!("Test area {id}")),
        bounds,
        center: remote.center.unwrap_or_else(|| bounds.center()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::MemoryKeyValueStore;

    fn setup() -> (Arc<MemoryKeyValueStore>, ChangeTracker) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let tracker = ChangeTracker::new(store.clone());
        (store, tracker)
    }

    fn encode(json: &serde_json::Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(json.to_string())
    }

    #[tokio::test]
    async fn reads_pending_changes_verbatim() {
        let (store, tracker) = setup();
        store.add_members("changed_coords:guangfu", ["23.6677_121.4370", "garbage"]);

        let pending = tracker.pending_changes("guangfu").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.contains(&GeoKey::from("garbage")));
        assert!(tracker.pending_changes("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn classifies_points_from_scores() {
        let (store, tracker) = setup();
        store.set_hash_field("geo:g:1.0000_2.0000", "Score_0", "1");
        store.set_hash_field("geo:g:1.0000_2.0000", "Score_1", "3.5");
        store.set_hash_field("geo:g:1.0000_2.0001", "Score_0", "2");
        store.set_hash_field("geo:g:1.0000_2.0002", "Score_1", "not-a-number");

        let keys: BTreeSet<GeoKey> = ["1.0000_2.0000", "1.0000_2.0001", "1.0000_2.0002", "1.0000_2.0003"]
            .into_iter()
            .map(GeoKey::from)
            .collect();
        let states = tracker.point_states("g", &keys).await.unwrap();

        assert_eq!(states[&GeoKey::from("1.0000_2.0000")], PointState::Muddy);
        assert_eq!(states[&GeoKey::from("1.0000_2.0001")], PointState::Clear);
        assert_eq!(states[&GeoKey::from("1.0000_2.0002")], PointState::Undefined);
        assert_eq!(states[&GeoKey::from("1.0000_2.0003")], PointState::Undefined);
    }

    #[tokio::test]
    async fn clear_removes_the_whole_set() {
        let (store, tracker) = setup();
        store.add_members("changed_coords:g", ["a", "b"]);
        tracker.clear("g").await.unwrap();
        assert!(!store.contains_key("changed_coords:g"));
    }

    #[tokio::test]
    async fn latest_version_round_trip() {
        let (store, tracker) = setup();
        assert_eq!(tracker.latest_version("g").await.unwrap(), None);

        tracker.set_latest_version("g", 1_700_000_000).await.unwrap();
        assert_eq!(tracker.latest_version("g").await.unwrap(), Some(1_700_000_000));

        store.set_string("tile_version:g", "v2");
        assert_eq!(tracker.latest_version("g").await.unwrap(), None);
    }

    #[tokio::test]
    async fn loads_remote_test_areas_and_skips_broken_ones() {
        let (store, tracker) = setup();
        store.add_members("test_areas:list", ["test_a", "test_b", "test_c"]);
        store.set_string(
            "test_areas:test_a",
            encode(&serde_json::json!({
                "displayName": "Test A",
                "bounds": {
                    "northWest": {"lat": 25.089, "lng": 121.457},
                    "northEast": {"lat": 25.089, "lng": 121.460},
                    "southWest": {"lat": 25.086, "lng": 121.457},
                    "southEast": {"lat": 25.086, "lng": 121.460}
                },
                "center": {"lat": 25.0875, "lng": 121.4585}
            })),
        );
        store.set_string("test_areas:test_b", "%%% not base64");

        let areas = tracker.fetch_remote_areas().await.unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].name, "test_a");
        assert_eq!(areas[0].display_name, "Test A");
        assert!(areas[0].bounds.contains(25.0875, 121.4585));
    }

    #[test]
    fn remote_area_without_center_uses_bounds_midpoint() {
        let raw = encode(&serde_json::json!({
            "bounds": {
                "northWest": {"lat": 2.0, "lon": 0.0},
                "northEast": {"lat": 2.0, "lon": 4.0},
                "southWest": {"lat": 0.0, "lon": 0.0},
                "southEast": {"lat": 0.0, "lon": 4.0}
            }
        }));
        let area = decode_remote_area("test_x", &raw).unwrap();
        assert_eq!(area.display_name, "Test area test_x");
        assert!((area.center.lat - 1.0).abs() < 1e-12);
        assert!((area.center.lon - 2.0).abs() < 1e-12);
    }
}

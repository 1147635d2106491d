//! Ingestion configuration, per-station state, and their persistence.
//!
//! Both documents live under the data path and are rewritten on every
//! mutation: `config.json` holds the operator-tunable settings, `state.json`
//! the per-station watermarks and counters that let a restart resume where
//! it left off.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decode::frame::Product;
use crate::error::{Error, Result};

/// Name of the persisted configuration document.
const CONFIG_FILE: &str = "config.json";

/// Name of the persisted per-station state document.
const STATE_FILE: &str = "state.json";

// =============================================================================
// IngestConfig
// =============================================================================

/// Operator-tunable pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Stations to monitor; the sentinel `"ALL"` expands to every station
    /// with data today
    pub monitored_stations: BTreeSet<String>,
    /// Products decoded from each volume
    pub products: Vec<Product>,

    /// Seconds between discovery scans
    pub scan_interval_seconds: u64,
    /// Frames retained per (station, product)
    pub max_frames_per_station: usize,
    /// Seconds between cleanup passes
    pub cleanup_interval_seconds: u64,
    pub auto_cleanup_enabled: bool,
    /// Whether an unwatermarked station backfills recent history
    pub catchup_enabled: bool,

    /// Fetch worker count
    pub fetcher_thread_pool_size: usize,
    /// Discovery worker count
    pub discovery_parallelism: usize,
    /// Buffers in the shared pool
    pub buffer_pool_size: usize,
    /// Bytes per pooled buffer
    pub buffer_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            monitored_stations: ["KTLX", "KCRP", "KEWX"]
                .into_iter()
                .map(String::from)
                .collect(),
            products: vec![
                Product::Reflectivity,
                Product::Velocity,
                Product::CorrelationCoefficient,
            ],
            scan_interval_seconds: 30,
            max_frames_per_station: 30,
            cleanup_interval_seconds: 300,
            auto_cleanup_enabled: true,
            catchup_enabled: true,
            fetcher_thread_pool_size: 8,
            discovery_parallelism: 10,
            buffer_pool_size: 64,
            buffer_size: 120 * 1024 * 1024,
        }
    }
}

impl IngestConfig {
    /// True when applying `update` would require rebuilding the pools.
    pub fn pools_differ(&self, other: &IngestConfig) -> bool {
        self.fetcher_thread_pool_size != other.fetcher_thread_pool_size
            || self.discovery_parallelism != other.discovery_parallelism
            || self.buffer_pool_size != other.buffer_pool_size
            || self.buffer_size != other.buffer_size
    }
}

// =============================================================================
// ConfigUpdate
// =============================================================================

/// A partial configuration: only the named fields change.
///
/// The station set in particular survives unrelated reconfigurations, so a
/// station added through the API is not lost when someone adjusts the scan
/// interval.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub monitored_stations: Option<BTreeSet<String>>,
    pub products: Option<Vec<Product>>,
    pub scan_interval_seconds: Option<u64>,
    pub max_frames_per_station: Option<usize>,
    pub cleanup_interval_seconds: Option<u64>,
    pub auto_cleanup_enabled: Option<bool>,
    pub catchup_enabled: Option<bool>,
    pub fetcher_thread_pool_size: Option<usize>,
    pub discovery_parallelism: Option<usize>,
    pub buffer_pool_size: Option<usize>,
    pub buffer_size: Option<usize>,
}

impl ConfigUpdate {
    /// Apply onto `config`, returning the result.
    pub fn apply(&self, config: &IngestConfig) -> IngestConfig {
        let mut next = config.clone();
        if let Some(stations) = &self.monitored_stations {
            next.monitored_stations = stations.clone();
        }
        if let Some(products) = &self.products {
            next.products = products.clone();
        }
        if let Some(v) = self.scan_interval_seconds {
            next.scan_interval_seconds = v;
        }
        if let Some(v) = self.max_frames_per_station {
            next.max_frames_per_station = v;
        }
        if let Some(v) = self.cleanup_interval_seconds {
            next.cleanup_interval_seconds = v;
        }
        if let Some(v) = self.auto_cleanup_enabled {
            next.auto_cleanup_enabled = v;
        }
        if let Some(v) = self.catchup_enabled {
            next.catchup_enabled = v;
        }
        if let Some(v) = self.fetcher_thread_pool_size {
            next.fetcher_thread_pool_size = v;
        }
        if let Some(v) = self.discovery_parallelism {
            next.discovery_parallelism = v;
        }
        if let Some(v) = self.buffer_pool_size {
            next.buffer_pool_size = v;
        }
        if let Some(v) = self.buffer_size {
            next.buffer_size = v;
        }
        next
    }

    /// Parse a posted partial-config body.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }
}

// =============================================================================
// StationStats
// =============================================================================

/// Persistent per-station counters and the discovery watermark.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationStats {
    pub frames_fetched: u64,
    pub frames_failed: u64,
    /// Nanoseconds since the epoch of the last fetch attempt
    pub last_fetch_timestamp: i64,
    /// Timestamp string of the newest persisted frame
    pub last_frame_timestamp: String,
    /// Lexicographically last object key already examined
    pub last_processed_key: String,
    #[serde(default)]
    pub last_scan_timestamp: i64,
}

/// Shape of `state.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    station_stats: HashMap<String, StationStats>,
}

// =============================================================================
// Persistence
// =============================================================================

/// Load `config.json` as a partial update over the built-in defaults.
/// Missing file or malformed JSON falls back to `base` with a warning.
pub fn load_config(data_path: &Path, base: &IngestConfig) -> IngestConfig {
    let path = data_path.join(CONFIG_FILE);
    let Ok(bytes) = fs::read(&path) else {
        return base.clone();
    };
    match serde_json::from_slice::<ConfigUpdate>(&bytes) {
        Ok(update) => {
            info!("loaded configuration from {:?}", path);
            update.apply(base)
        }
        Err(e) => {
            warn!("ignoring malformed {:?}: {}", path, e);
            base.clone()
        }
    }
}

/// Persist the full configuration document. Best effort: failures log.
pub fn save_config(data_path: &Path, config: &IngestConfig) {
    if let Err(e) = try_save_config(data_path, config) {
        warn!("failed to save config: {}", e);
    }
}

fn try_save_config(data_path: &Path, config: &IngestConfig) -> Result<()> {
    fs::create_dir_all(data_path)?;
    let json = serde_json::to_vec_pretty(config)
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
    fs::write(data_path.join(CONFIG_FILE), json)?;
    Ok(())
}

/// Load per-station state; a missing or malformed file yields empty state.
pub fn load_state(data_path: &Path) -> HashMap<String, StationStats> {
    let path = data_path.join(STATE_FILE);
    let Ok(bytes) = fs::read(&path) else {
        return HashMap::new();
    };
    match serde_json::from_slice::<StateFile>(&bytes) {
        Ok(state) => {
            info!("loaded state for {} stations", state.station_stats.len());
            state.station_stats
        }
        Err(e) => {
            warn!("ignoring malformed {:?}: {}", path, e);
            HashMap::new()
        }
    }
}

/// Persist per-station state. Best effort: failures log.
pub fn save_state(data_path: &Path, stats: &HashMap<String, StationStats>) {
    let state = StateFile {
        station_stats: stats.clone(),
    };
    let result = fs::create_dir_all(data_path)
        .map_err(Error::from)
        .and_then(|_| {
            serde_json::to_vec_pretty(&state).map_err(|e| Error::ConfigInvalid(e.to_string()))
        })
        .and_then(|json| fs::write(data_path.join(STATE_FILE), json).map_err(Error::from));
    if let Err(e) = result {
        warn!("failed to save state: {}", e);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.monitored_stations.len(), 3);
        assert!(config.monitored_stations.contains("KTLX"));
        assert_eq!(config.fetcher_thread_pool_size, 8);
        assert_eq!(config.discovery_parallelism, 10);
        assert_eq!(config.buffer_size, 120 * 1024 * 1024);
    }

    #[test]
    fn test_config_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut config = IngestConfig::default();
        config.scan_interval_seconds = 45;
        config.monitored_stations.insert("KABR".into());

        save_config(dir.path(), &config);
        let loaded = load_config(dir.path(), &IngestConfig::default());
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_file_merges_over_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            br#"{"scan_interval_seconds": 99}"#,
        )
        .unwrap();

        let loaded = load_config(dir.path(), &IngestConfig::default());
        assert_eq!(loaded.scan_interval_seconds, 99);
        // Everything else keeps its default
        assert_eq!(loaded.max_frames_per_station, 30);
        assert!(loaded.monitored_stations.contains("KCRP"));
    }

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), b"{not json").unwrap();
        let loaded = load_config(dir.path(), &IngestConfig::default());
        assert_eq!(loaded, IngestConfig::default());
    }

    #[test]
    fn test_update_preserves_stations_when_absent() {
        let mut config = IngestConfig::default();
        config.monitored_stations.insert("KABR".into());

        let update = ConfigUpdate {
            scan_interval_seconds: Some(60),
            ..Default::default()
        };
        let next = update.apply(&config);

        assert_eq!(next.scan_interval_seconds, 60);
        assert!(next.monitored_stations.contains("KABR"));
        assert_eq!(next.monitored_stations, config.monitored_stations);
    }

    #[test]
    fn test_update_detects_pool_changes() {
        let config = IngestConfig::default();
        let unchanged = ConfigUpdate {
            scan_interval_seconds: Some(5),
            ..Default::default()
        }
        .apply(&config);
        assert!(!config.pools_differ(&unchanged));

        let resized = ConfigUpdate {
            fetcher_thread_pool_size: Some(2),
            ..Default::default()
        }
        .apply(&config);
        assert!(config.pools_differ(&resized));
    }

    #[test]
    fn test_update_rejects_unknown_fields() {
        assert!(ConfigUpdate::from_json(br#"{"no_such_knob": 1}"#).is_err());
        assert!(ConfigUpdate::from_json(br#"{"catchup_enabled": true}"#).is_ok());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut stats = HashMap::new();
        stats.insert(
            "KTLX".to_string(),
            StationStats {
                frames_fetched: 12,
                frames_failed: 1,
                last_processed_key: "2024/01/01/KTLX/KTLX20240101_123456_V06".into(),
                last_frame_timestamp: "20240101_123456".into(),
                ..Default::default()
            },
        );

        save_state(dir.path(), &stats);
        let loaded = load_state(dir.path());
        assert_eq!(loaded["KTLX"].frames_fetched, 12);
        assert_eq!(
            loaded["KTLX"].last_processed_key,
            "2024/01/01/KTLX/KTLX20240101_123456_V06"
        );
    }

    #[test]
    fn test_missing_state_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_state(dir.path()).is_empty());
    }
}

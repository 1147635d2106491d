//! Discovery scan types and the per-station concurrency guard.
//!
//! Archive keys follow `{YYYY}/{MM}/{DD}/{STATION}/{STATION}{date}_{time}_V06`;
//! key order is chronological by construction, which the watermark logic
//! leans on. The scan itself runs in [`crate::pipeline::ingestor`], which
//! owns the stores and queues.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Items per batch; small enough that stations interleave on the fetch pool.
pub const BATCH_SIZE: usize = 5;

/// One discovered object to fetch and transcode.
#[derive(Debug, Clone)]
pub struct DiscoveryItem {
    pub station: String,
    pub bucket: String,
    pub key: String,
    pub timestamp: String,
}

/// A group of items for one station, processed sequentially on one worker
/// so a single station's large volumes do not contend for buffers.
#[derive(Debug, Clone)]
pub struct DiscoveryBatch {
    pub station: String,
    pub items: Vec<DiscoveryItem>,
}

impl DiscoveryBatch {
    pub fn new(station: &str) -> Self {
        DiscoveryBatch {
            station: station.to_string(),
            items: Vec::new(),
        }
    }
}

/// Day prefix for a station: `{YYYY}/{MM}/{DD}/{STATION}/`.
pub fn station_day_prefix(now: DateTime<Utc>, station: &str) -> String {
    format!("{}/{}/", now.format("%Y/%m/%d"), station)
}

/// Day prefix without a station: `{YYYY}/{MM}/{DD}/`.
pub fn day_prefix(now: DateTime<Utc>) -> String {
    format!("{}/", now.format("%Y/%m/%d"))
}

/// Extract the station name from a common prefix like
/// `2024/01/01/KTLX/`.
pub fn station_from_prefix(prefix: &str) -> Option<&str> {
    prefix.trim_end_matches('/').rsplit('/').next()
}

/// True for keys discovery must ignore: metadata companions and names too
/// short to carry a timestamp.
pub fn should_skip_filename(filename: &str) -> bool {
    filename.contains("_MDM") || filename.len() < 20
}

/// Derive the artifact timestamp from an archive filename, e.g.
/// `KTLX20240101_123456_V06` -> `20240101_123456`.
pub fn derive_timestamp(filename: &str) -> Option<String> {
    if filename.len() < 12 {
        return None;
    }
    let date = filename.get(4..12)?;
    let underscore = filename.find('_')?;
    let time = filename.get(underscore + 1..underscore + 7)?;
    Some(format!("{}_{}", date, time))
}

// =============================================================================
// Scan Registry
// =============================================================================

/// Station-keyed set of in-flight scans. The scheduler refuses to enqueue a
/// scan for a station that already has one; the guard removes its entry on
/// every exit path.
#[derive(Default)]
pub struct ScanRegistry {
    active: Mutex<HashSet<String>>,
}

impl ScanRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Begin a scan for `station`, or `None` when one is already running.
    pub fn begin(registry: &Arc<Self>, station: &str) -> Option<ScopedScan> {
        let mut active = registry.active.lock();
        if !active.insert(station.to_string()) {
            return None;
        }
        Some(ScopedScan {
            registry: Arc::clone(registry),
            station: station.to_string(),
        })
    }

    pub fn is_scanning(&self, station: &str) -> bool {
        self.active.lock().contains(station)
    }

    pub fn active_stations(&self) -> Vec<String> {
        let mut stations: Vec<String> = self.active.lock().iter().cloned().collect();
        stations.sort();
        stations
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Sentinel for one in-flight scan; unregisters on drop.
pub struct ScopedScan {
    registry: Arc<ScanRegistry>,
    station: String,
}

impl Drop for ScopedScan {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.station);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_prefixes() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(station_day_prefix(now, "KTLX"), "2024/03/07/KTLX/");
        assert_eq!(day_prefix(now), "2024/03/07/");
    }

    #[test]
    fn test_station_from_prefix() {
        assert_eq!(station_from_prefix("2024/01/01/KTLX/"), Some("KTLX"));
        assert_eq!(station_from_prefix("2024/01/01/KEWX"), Some("KEWX"));
    }

    #[test]
    fn test_filename_filters() {
        assert!(should_skip_filename("KTLX20240101_123456_MDM"));
        assert!(should_skip_filename("short"));
        assert!(!should_skip_filename("KTLX20240101_123456_V06"));
    }

    #[test]
    fn test_derive_timestamp() {
        assert_eq!(
            derive_timestamp("KTLX20240101_123456_V06"),
            Some("20240101_123456".to_string())
        );
        assert_eq!(derive_timestamp("x"), None);
    }

    #[test]
    fn test_scan_registry_excludes_duplicates() {
        let registry = ScanRegistry::new();
        let guard = ScanRegistry::begin(&registry, "KTLX").expect("first scan allowed");
        assert!(registry.is_scanning("KTLX"));
        assert!(ScanRegistry::begin(&registry, "KTLX").is_none());
        // A different station is unaffected
        assert!(ScanRegistry::begin(&registry, "KEWX").is_some());

        drop(guard);
        assert!(!registry.is_scanning("KTLX"));
        assert!(ScanRegistry::begin(&registry, "KTLX").is_some());
    }

    #[test]
    fn test_active_listing() {
        let registry = ScanRegistry::new();
        let _a = ScanRegistry::begin(&registry, "KTLX");
        let _b = ScanRegistry::begin(&registry, "KCRP");
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.active_stations(), vec!["KCRP", "KTLX"]);
    }
}

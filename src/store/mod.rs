//! Disk-backed frame store with per-(station, product) indexing.
//!
//! Layout: `{base}/{station}/{timestamp}/{product}/{tilt:.1}.RDA` for tilts
//! and `volumetric.RDA` for volumes, with a gzipped JSON index per
//! (station, product) at `{base}/{station}/index_{product}.json`. Timestamp
//! directory names sort chronologically by construction, which cleanup and
//! discovery both rely on.
//!
//! The pipeline hands finished artifacts to a dedicated storage writer
//! thread through a write queue, overlapping persistence with decoding;
//! queued tasks drain to completion on shutdown. When the writer is not
//! running, queued writes execute synchronously on the caller.

pub mod artifact;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::decode::frame::Product;
use crate::error::{Error, Result};
use artifact::{Artifact, ArtifactMeta};

/// Filename of the combined-volume artifact inside a product directory.
const VOLUMETRIC_FILENAME: &str = "volumetric.RDA";

// =============================================================================
// Index Types
// =============================================================================

/// One frame reference inside an index file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Timestamp
    pub t: String,
    /// Tilt in degrees (0.0 for volumetric artifacts)
    pub e: f32,
}

/// Per-(station, product) index, persisted gzipped and mirrored in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameIndex {
    /// Station
    pub s: String,
    /// Product tag
    pub p: String,
    /// Last-update time in nanoseconds since the epoch
    pub u: i64,
    /// Frame count
    pub c: usize,
    /// Frame references, newest first
    pub f: Vec<IndexEntry>,
}

/// Metadata of one stored artifact, from a directory scan.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub station: String,
    pub product: String,
    pub timestamp: String,
    pub tilt: f32,
    pub file_size: u64,
    pub file_path: PathBuf,
}

// =============================================================================
// Write Queue
// =============================================================================

/// A persistence request for the background writer thread.
#[derive(Debug)]
pub enum WriteTask {
    Tilt {
        station: String,
        product: Product,
        timestamp: String,
        tilt: f32,
        num_rays: u16,
        num_gates: u16,
        gate_spacing: f32,
        first_gate: f32,
        bitmask: Vec<u8>,
        values: Vec<u8>,
    },
    Volumetric {
        station: String,
        product: Product,
        timestamp: String,
        tilts: Vec<f32>,
        num_rays: u16,
        num_gates: u16,
        gate_spacing: f32,
        first_gate: f32,
        bitmask: Vec<u8>,
        values: Vec<u8>,
    },
}

struct WriterHandle {
    tx: Sender<WriteTask>,
    handle: JoinHandle<()>,
}

// =============================================================================
// FrameStore
// =============================================================================

/// Persistent storage and indexing for transcoded radar frames.
pub struct FrameStore {
    base_path: PathBuf,
    index_cache: RwLock<HashMap<String, FrameIndex>>,
    writer: Mutex<Option<WriterHandle>>,
}

impl FrameStore {
    /// Open (and create if needed) a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(FrameStore {
            base_path,
            index_cache: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    fn tilt_filename(tilt: f32) -> String {
        format!("{:.1}.RDA", tilt)
    }

    fn product_dir(&self, station: &str, timestamp: &str, product: &str) -> PathBuf {
        self.base_path.join(station).join(timestamp).join(product)
    }

    fn index_path(&self, station: &str, product: &str) -> PathBuf {
        self.base_path
            .join(station)
            .join(format!("index_{}.json", product))
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Persist one per-tilt bitmask artifact and refresh the index.
    #[allow(clippy::too_many_arguments)]
    pub fn save_tilt(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        tilt: f32,
        num_rays: u16,
        num_gates: u16,
        gate_spacing: f32,
        first_gate: f32,
        bitmask: &[u8],
        values: &[u8],
    ) -> Result<()> {
        let metadata = ArtifactMeta {
            s: station.to_string(),
            p: product.as_str().to_string(),
            t: timestamp.to_string(),
            e: Some(tilt),
            f: "b".to_string(),
            tilts: None,
            r: num_rays,
            g: num_gates,
            gs: gate_spacing,
            fg: first_gate,
            v: values.len(),
        };
        let dir = self.product_dir(station, timestamp, product.as_str());
        fs::create_dir_all(&dir)?;
        let encoded = artifact::encode(&metadata, bitmask, values)?;
        fs::write(dir.join(Self::tilt_filename(tilt)), encoded)?;
        self.update_index(station, product.as_str());
        Ok(())
    }

    /// Persist the combined-volume artifact and refresh the index.
    #[allow(clippy::too_many_arguments)]
    pub fn save_volumetric(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        tilts: &[f32],
        num_rays: u16,
        num_gates: u16,
        gate_spacing: f32,
        first_gate: f32,
        bitmask: &[u8],
        values: &[u8],
    ) -> Result<()> {
        let metadata = ArtifactMeta {
            s: station.to_string(),
            p: product.as_str().to_string(),
            t: timestamp.to_string(),
            e: None,
            f: "b".to_string(),
            tilts: Some(tilts.to_vec()),
            r: num_rays,
            g: num_gates,
            gs: gate_spacing,
            fg: first_gate,
            v: values.len(),
        };
        let dir = self.product_dir(station, timestamp, product.as_str());
        fs::create_dir_all(&dir)?;
        let encoded = artifact::encode(&metadata, bitmask, values)?;
        fs::write(dir.join(VOLUMETRIC_FILENAME), encoded)?;
        self.update_index(station, product.as_str());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Load one per-tilt artifact.
    pub fn load_tilt(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        tilt: f32,
    ) -> Result<Artifact> {
        let path = self
            .product_dir(station, timestamp, product.as_str())
            .join(Self::tilt_filename(tilt));
        artifact::decode(&fs::read(path)?)
    }

    /// Load the combined-volume artifact.
    pub fn load_volumetric(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
    ) -> Result<Artifact> {
        let path = self
            .product_dir(station, timestamp, product.as_str())
            .join(VOLUMETRIC_FILENAME);
        artifact::decode(&fs::read(path)?)
    }

    /// True when the (station, product, timestamp) directory already exists;
    /// discovery uses this to skip volumes that are fully persisted.
    pub fn has_timestamp_product(&self, station: &str, product: &str, timestamp: &str) -> bool {
        self.product_dir(station, timestamp, product).is_dir()
    }

    // -------------------------------------------------------------------------
    // Index
    // -------------------------------------------------------------------------

    /// Rebuild and persist the index for one (station, product), updating
    /// the in-memory mirror.
    pub fn update_index(&self, station: &str, product: &str) {
        let mut cache = self.index_cache.write();
        let frames = self.scan_directory(station, product);

        let index = FrameIndex {
            s: station.to_string(),
            p: product.to_string(),
            u: Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000),
            c: frames.len(),
            f: frames
                .iter()
                .map(|frame| IndexEntry {
                    t: frame.timestamp.clone(),
                    e: frame.tilt,
                })
                .collect(),
        };

        if let Err(e) = self.write_index_file(station, product, &index) {
            warn!("failed to persist index for {}/{}: {}", station, product, e);
        }
        cache.insert(format!("{}/{}", station, product), index);
    }

    fn write_index_file(&self, station: &str, product: &str, index: &FrameIndex) -> Result<()> {
        let json = serde_json::to_vec(index)
            .map_err(|e| Error::ConfigInvalid(format!("index serialization: {}", e)))?;
        let compressed = artifact::gzip_compress(&json)?;
        let path = self.index_path(station, product);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, compressed)?;
        Ok(())
    }

    /// Fetch the index for one (station, product), from cache or disk.
    pub fn index(&self, station: &str, product: &str) -> FrameIndex {
        let key = format!("{}/{}", station, product);
        {
            let cache = self.index_cache.read();
            if let Some(index) = cache.get(&key) {
                return index.clone();
            }
        }

        let path = self.index_path(station, product);
        match fs::read(&path)
            .map_err(Error::from)
            .and_then(|data| artifact::gzip_decompress(&data))
            .and_then(|json| {
                serde_json::from_slice(&json)
                    .map_err(|e| Error::ConfigInvalid(format!("index parse: {}", e)))
            }) {
            Ok(index) => index,
            Err(_) => FrameIndex::default(),
        }
    }

    /// List all stored artifacts for one (station, product), newest first.
    pub fn list_frames(&self, station: &str, product: &str) -> Vec<FrameMetadata> {
        self.scan_directory(station, product)
    }

    fn scan_directory(&self, station: &str, product: &str) -> Vec<FrameMetadata> {
        let mut frames = Vec::new();
        let station_dir = self.base_path.join(station);
        let Ok(entries) = fs::read_dir(&station_dir) else {
            return frames;
        };

        for ts_entry in entries.flatten() {
            if !ts_entry.path().is_dir() {
                continue;
            }
            let timestamp = ts_entry.file_name().to_string_lossy().to_string();
            let product_dir = ts_entry.path().join(product);
            let Ok(files) = fs::read_dir(&product_dir) else {
                continue;
            };
            for file_entry in files.flatten() {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("RDA") {
                    continue;
                }
                let tilt = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<f32>().ok())
                    .unwrap_or(0.0);
                let file_size = file_entry.metadata().map(|m| m.len()).unwrap_or(0);
                frames.push(FrameMetadata {
                    station: station.to_string(),
                    product: product.to_string(),
                    timestamp: timestamp.clone(),
                    tilt,
                    file_size,
                    file_path: path,
                });
            }
        }
        frames.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        frames
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// Trim each (station, product) to its newest `max_frames_per_station`
    /// timestamp directories.
    pub fn cleanup_old_frames(&self, max_frames_per_station: usize) {
        let Ok(stations) = fs::read_dir(&self.base_path) else {
            return;
        };

        for station_entry in stations.flatten() {
            let station_path = station_entry.path();
            if !station_path.is_dir() {
                continue;
            }
            let station = station_entry.file_name().to_string_lossy().to_string();

            // product -> timestamps holding it
            let mut products: HashMap<String, Vec<String>> = HashMap::new();
            let Ok(timestamps) = fs::read_dir(&station_path) else {
                continue;
            };
            for ts_entry in timestamps.flatten() {
                if !ts_entry.path().is_dir() {
                    continue;
                }
                let timestamp = ts_entry.file_name().to_string_lossy().to_string();
                let Ok(product_dirs) = fs::read_dir(ts_entry.path()) else {
                    continue;
                };
                for prod_entry in product_dirs.flatten() {
                    if prod_entry.path().is_dir() {
                        products
                            .entry(prod_entry.file_name().to_string_lossy().to_string())
                            .or_default()
                            .push(timestamp.clone());
                    }
                }
            }

            for (product, mut timestamps) in products {
                // Timestamp strings sort chronologically; newest first
                timestamps.sort_by(|a, b| b.cmp(a));
                if timestamps.len() <= max_frames_per_station {
                    continue;
                }
                for stale in &timestamps[max_frames_per_station..] {
                    let dir = station_path.join(stale).join(&product);
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!("cleanup failed for {:?}: {}", dir, e);
                    }
                }
                debug!(
                    "cleanup trimmed {}/{} to {} frames",
                    station, product, max_frames_per_station
                );
                self.update_index(&station, &product);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    /// Total bytes under the store root.
    pub fn total_disk_usage(&self) -> u64 {
        fn walk(dir: &Path, total: &mut u64) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, total);
                } else if let Ok(meta) = entry.metadata() {
                    *total += meta.len();
                }
            }
        }
        let mut total = 0;
        walk(&self.base_path, &mut total);
        total
    }

    /// Number of `.RDA` artifacts under the store root.
    pub fn frame_count(&self) -> usize {
        fn walk(dir: &Path, count: &mut usize) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, count);
                } else if path.extension().and_then(|e| e.to_str()) == Some("RDA") {
                    *count += 1;
                }
            }
        }
        let mut count = 0;
        walk(&self.base_path, &mut count);
        count
    }

    // -------------------------------------------------------------------------
    // Background writer
    // -------------------------------------------------------------------------

    /// Start the background writer thread. Queued tasks are drained to
    /// completion on shutdown.
    pub fn start_writer(store: &std::sync::Arc<Self>) {
        let mut writer = store.writer.lock();
        if writer.is_some() {
            return;
        }
        let (tx, rx) = unbounded::<WriteTask>();
        let store = std::sync::Arc::clone(store);
        let handle = std::thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    if let Err(e) = store.process_write_task(task) {
                        error!("async write failed: {}", e);
                    }
                }
                info!("storage writer drained");
            })
            .expect("spawn storage writer");
        *writer = Some(WriterHandle { tx, handle });
    }

    /// Queue a write for the background writer. Falls back to a synchronous
    /// write when the writer is not running.
    pub fn enqueue_write(&self, task: WriteTask) {
        let writer = self.writer.lock();
        match writer.as_ref() {
            Some(handle) => {
                if handle.tx.send(task).is_err() {
                    warn!("storage writer gone; write dropped");
                }
            }
            None => {
                drop(writer);
                if let Err(e) = self.process_write_task(task) {
                    error!("synchronous write failed: {}", e);
                }
            }
        }
    }

    fn process_write_task(&self, task: WriteTask) -> Result<()> {
        match task {
            WriteTask::Tilt {
                station,
                product,
                timestamp,
                tilt,
                num_rays,
                num_gates,
                gate_spacing,
                first_gate,
                bitmask,
                values,
            } => self.save_tilt(
                &station, product, &timestamp, tilt, num_rays, num_gates, gate_spacing,
                first_gate, &bitmask, &values,
            ),
            WriteTask::Volumetric {
                station,
                product,
                timestamp,
                tilts,
                num_rays,
                num_gates,
                gate_spacing,
                first_gate,
                bitmask,
                values,
            } => self.save_volumetric(
                &station, product, &timestamp, &tilts, num_rays, num_gates, gate_spacing,
                first_gate, &bitmask, &values,
            ),
        }
    }

    /// Stop the background writer, draining queued tasks first.
    pub fn shutdown_writer(&self) {
        let handle = self.writer.lock().take();
        if let Some(WriterHandle { tx, handle }) = handle {
            drop(tx);
            if handle.join().is_err() {
                error!("storage writer panicked");
            }
        }
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.shutdown_writer();
    }
}

// =============================================================================
// Tests
// =============================================================================

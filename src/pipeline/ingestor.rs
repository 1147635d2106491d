//! The ingestion pipeline: discovery scheduling, fetch dispatch, transcode,
//! and persistence.
//!
//! Three dedicated threads drive the pipeline: a scheduler that wakes the
//! discovery scanner every scan interval, a dispatcher that moves discovery
//! batches onto the fetch pool, and a cleanup thread on its own cadence.
//! The worker pools and buffer pool are swapped atomically on
//! reconfiguration and the old pools drained out of line, so in-flight work
//! is never dropped.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::decode::frame::{Product, RadarFrame};
use crate::decode::parser::decode_volume_multi;
use crate::object_store::{ObjectStore, NEXRAD_BUCKET};
use crate::pipeline::buffer_pool::BufferPool;
use crate::pipeline::config::{
    load_config, load_state, save_config, save_state, ConfigUpdate, IngestConfig, StationStats,
};
use crate::pipeline::discovery::{
    day_prefix, derive_timestamp, should_skip_filename, station_day_prefix, station_from_prefix,
    DiscoveryBatch, DiscoveryItem, ScanRegistry, BATCH_SIZE,
};
use crate::pipeline::worker_pool::WorkerPool;
use crate::store::{FrameStore, WriteTask};
use crate::transcode::grid::{
    grid_spec_for_tilt, rasterize_tilt, volume_cell_count, VOLUME_RAYS,
};
use crate::transcode::{bitmask, quant_range};

/// Sentinel station name that expands to every station with data today.
const ALL_STATIONS: &str = "ALL";

/// Granularity of the scheduler's shutdown polling.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// How long the dispatcher blocks on the discovery queue per wait.
const DISPATCH_WAIT: Duration = Duration::from_secs(1);

struct Pools {
    fetch: Arc<WorkerPool>,
    discovery: Arc<WorkerPool>,
    buffers: BufferPool,
}

struct Shared {
    store: Arc<FrameStore>,
    objects: Arc<dyn ObjectStore>,
    data_path: PathBuf,

    config: Mutex<IngestConfig>,
    stats: Mutex<HashMap<String, StationStats>>,
    pools: Mutex<Pools>,

    queue: Mutex<VecDeque<DiscoveryBatch>>,
    queue_ready: Condvar,
    scans: Arc<ScanRegistry>,

    should_stop: AtomicBool,
    is_running: AtomicBool,
    paused: AtomicBool,

    frames_fetched: AtomicU64,
    frames_failed: AtomicU64,
    last_fetch_timestamp: AtomicI64,
    started_at: Instant,
}

/// The background ingestion service.
pub struct Ingestor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Ingestor {
    /// Build the pipeline: load persisted config and state, then size the
    /// pools. Threads start on [`start`](Self::start).
    pub fn new(
        store: Arc<FrameStore>,
        objects: Arc<dyn ObjectStore>,
        initial_config: IngestConfig,
        data_path: impl Into<PathBuf>,
    ) -> Self {
        let data_path = data_path.into();
        let config = load_config(&data_path, &initial_config);
        let stats = load_state(&data_path);
        let pools = build_pools(&config);

        Ingestor {
            shared: Arc::new(Shared {
                store,
                objects,
                data_path,
                config: Mutex::new(config),
                stats: Mutex::new(stats),
                pools: Mutex::new(pools),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Condvar::new(),
                scans: ScanRegistry::new(),
                should_stop: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                frames_fetched: AtomicU64::new(0),
                frames_failed: AtomicU64::new(0),
                last_fetch_timestamp: AtomicI64::new(0),
                started_at: Instant::now(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the storage writer plus the scheduler, dispatcher, and cleanup
    /// threads. Idempotent.
    pub fn start(&self) {
        if self.shared.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.should_stop.store(false, Ordering::SeqCst);

        // The fetch workers hand every finished artifact to this thread
        FrameStore::start_writer(&self.shared.store);

        let mut threads = self.threads.lock();
        for (name, entry) in [
            ("discovery-loop", discovery_loop as fn(Arc<Shared>)),
            ("fetch-loop", fetch_loop as fn(Arc<Shared>)),
            ("cleanup-loop", cleanup_loop as fn(Arc<Shared>)),
        ] {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name(name.into())
                    .spawn(move || entry(shared))
                    .expect("spawn pipeline thread"),
            );
        }
        info!("ingestion pipeline started");
    }

    /// Stop the pipeline: scheduler and dispatcher join first, then the
    /// worker pools drain, then cleanup joins, then the storage writer.
    pub fn stop(&self) {
        if !self.shared.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.should_stop.store(true, Ordering::SeqCst);
        {
            let _queue = self.shared.queue.lock();
            self.shared.queue_ready.notify_all();
        }

        let mut threads = self.threads.lock();
        // Spawn order is scheduler, dispatcher, cleanup; pools drain between
        // the dispatcher and cleanup joins.
        let mut iter = threads.drain(..);
        for handle in iter.by_ref().take(2) {
            let _ = handle.join();
        }
        {
            let pools = self.shared.pools.lock();
            pools.discovery.shutdown();
            pools.fetch.shutdown();
        }
        for handle in iter {
            let _ = handle.join();
        }
        drop(threads);

        self.shared.store.shutdown_writer();
        save_state(&self.shared.data_path, &self.shared.stats.lock());
        info!("ingestion pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Pause discovery scheduling without stopping in-flight work.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        info!("pipeline paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("pipeline resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Station management
    // -------------------------------------------------------------------------

    pub fn add_monitored_station(&self, station: &str) {
        {
            let mut config = self.shared.config.lock();
            config.monitored_stations.insert(station.to_string());
        }
        self.persist_config();
    }

    pub fn remove_monitored_station(&self, station: &str) {
        {
            let mut config = self.shared.config.lock();
            config.monitored_stations.remove(station);
        }
        self.persist_config();
    }

    pub fn set_monitored_stations(&self, stations: impl IntoIterator<Item = String>) {
        {
            let mut config = self.shared.config.lock();
            config.monitored_stations = stations.into_iter().collect();
        }
        self.persist_config();
    }

    pub fn monitored_stations(&self) -> Vec<String> {
        self.shared
            .config
            .lock()
            .monitored_stations
            .iter()
            .cloned()
            .collect()
    }

    fn persist_config(&self) {
        let config = self.shared.config.lock().clone();
        save_config(&self.shared.data_path, &config);
    }

    // -------------------------------------------------------------------------
    // Reconfiguration
    // -------------------------------------------------------------------------

    pub fn config(&self) -> IngestConfig {
        self.shared.config.lock().clone()
    }

    /// Apply a partial configuration. Pool-affecting changes swap in fresh
    /// pools under the lock and shut the old ones down outside it, so no
    /// queued task is lost.
    pub fn reconfigure(&self, update: &ConfigUpdate) -> IngestConfig {
        let (next, pools_changed) = {
            let mut config = self.shared.config.lock();
            let next = update.apply(&config);
            let changed = config.pools_differ(&next);
            *config = next.clone();
            (next, changed)
        };
        save_config(&self.shared.data_path, &next);

        if pools_changed {
            info!("configuration changed, reinitializing pools");
            let old = {
                let mut pools = self.shared.pools.lock();
                std::mem::replace(&mut *pools, build_pools(&next))
            };
            old.discovery.shutdown();
            old.fetch.shutdown();
        }
        next
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// The statistics document served by the control plane.
    pub fn statistics(&self) -> serde_json::Value {
        let shared = &self.shared;
        let config = shared.config.lock().clone();

        let mut doc = json!({
            "is_running": shared.is_running.load(Ordering::SeqCst),
            "paused": shared.paused.load(Ordering::SeqCst),
            "frames_fetched": shared.frames_fetched.load(Ordering::Relaxed),
            "frames_failed": shared.frames_failed.load(Ordering::Relaxed),
            "last_fetch_timestamp": shared.last_fetch_timestamp.load(Ordering::Relaxed),
            "monitored_stations": config.monitored_stations,
            "products": config.products,
            "max_frames_per_station": config.max_frames_per_station,
            "catchup_enabled": config.catchup_enabled,
            "scan_interval": config.scan_interval_seconds,
            "uptime_seconds": shared.started_at.elapsed().as_secs(),
        });

        {
            let pools = shared.pools.lock();
            doc["thread_pool"] = json!({
                "worker_count": pools.fetch.worker_count(),
                "active_threads": pools.fetch.active_count(),
                "pending_tasks": pools.fetch.pending_count(),
            });
            doc["discovery_pool"] = json!({
                "worker_count": pools.discovery.worker_count(),
                "active_threads": pools.discovery.active_count(),
                "pending_tasks": pools.discovery.pending_count(),
            });
            doc["buffer_pool"] = json!({
                "available": pools.buffers.available(),
                "buffer_bytes": pools.buffers.buffer_capacity(),
            });
        }

        doc["active_discovery_scans"] = json!({
            "count": shared.scans.active_count(),
            "stations": shared.scans.active_stations(),
        });

        {
            let stats = shared.stats.lock();
            let mut station_stats = serde_json::Map::new();
            for (station, s) in stats.iter() {
                station_stats.insert(
                    station.clone(),
                    serde_json::to_value(s).unwrap_or_default(),
                );
            }
            doc["station_stats"] = serde_json::Value::Object(station_stats);
        }

        doc["total_disk_usage_bytes"] = json!(shared.store.total_disk_usage());
        doc["frame_count"] = json!(shared.store.frame_count());
        doc
    }
}

impl Drop for Ingestor {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Pool construction
// =============================================================================

fn build_pools(config: &IngestConfig) -> Pools {
    let mut discovery_threads = config.discovery_parallelism;
    if let Ok(value) = std::env::var("NEXRAD_DISCOVERY_THREADS") {
        if let Ok(parsed) = value.parse::<usize>() {
            info!(
                "overriding discovery parallelism with {} from NEXRAD_DISCOVERY_THREADS",
                parsed
            );
            discovery_threads = parsed;
        }
    }

    info!(
        "initializing pools: {} fetch workers, {} discovery workers, {} x {} MB buffers",
        config.fetcher_thread_pool_size,
        discovery_threads,
        config.buffer_pool_size,
        config.buffer_size / (1024 * 1024)
    );

    Pools {
        fetch: Arc::new(WorkerPool::new(config.fetcher_thread_pool_size)),
        discovery: Arc::new(WorkerPool::new(discovery_threads)),
        buffers: BufferPool::new(config.buffer_pool_size, config.buffer_size),
    }
}

// =============================================================================
// Scheduler (discovery loop)
// =============================================================================

fn discovery_loop(shared: Arc<Shared>) {
    info!("discovery loop started");
    while !shared.should_stop.load(Ordering::SeqCst) {
        if !shared.paused.load(Ordering::SeqCst) {
            run_discovery_cycle(&shared);
        }

        // Persist watermarks after each cycle
        save_state(&shared.data_path, &shared.stats.lock());

        let interval = shared.config.lock().scan_interval_seconds;
        let deadline = Instant::now() + Duration::from_secs(interval);
        while Instant::now() < deadline && !shared.should_stop.load(Ordering::SeqCst) {
            std::thread::sleep(SHUTDOWN_POLL);
        }
    }
    info!("discovery loop stopped");
}

fn run_discovery_cycle(shared: &Arc<Shared>) {
    let mut stations = shared.config.lock().monitored_stations.clone();

    if stations.contains(ALL_STATIONS) {
        stations.remove(ALL_STATIONS);
        let prefix = day_prefix(Utc::now());
        match shared
            .objects
            .list_common_prefixes(NEXRAD_BUCKET, &prefix, "/")
        {
            Ok(prefixes) => {
                for p in prefixes {
                    if let Some(station) = station_from_prefix(&p) {
                        stations.insert(station.to_string());
                    }
                }
            }
            Err(e) => warn!("station wildcard expansion failed: {}", e),
        }
    }

    if stations.is_empty() {
        return;
    }

    let discovery_pool = Arc::clone(&shared.pools.lock().discovery);
    for station in stations {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        if shared.scans.is_scanning(&station) {
            continue;
        }
        let shared = Arc::clone(shared);
        discovery_pool.enqueue(move || scan_station(&shared, &station));
    }
}

fn scan_station(shared: &Arc<Shared>, station: &str) {
    let _guard = match ScanRegistry::begin(&shared.scans, station) {
        Some(guard) => guard,
        None => return,
    };
    debug!("scanning station {}", station);

    let prefix = station_day_prefix(Utc::now(), station);
    let last_key = shared
        .stats
        .lock()
        .get(station)
        .map(|s| s.last_processed_key.clone())
        .unwrap_or_default();

    let start_after = if last_key.is_empty() {
        None
    } else {
        Some(last_key.as_str())
    };
    let keys = match shared.objects.list_keys(NEXRAD_BUCKET, &prefix, start_after) {
        Ok(keys) => keys,
        Err(e) => {
            warn!("listing failed for {}: {}", station, e);
            return;
        }
    };
    if keys.is_empty() {
        return;
    }

    let (max_frames, catchup, products) = {
        let config = shared.config.lock();
        (
            config.max_frames_per_station,
            config.catchup_enabled,
            config.products.clone(),
        )
    };

    // Without a watermark, either backfill the most recent history or take
    // just the newest volume.
    let targets: &[String] = if last_key.is_empty() {
        if catchup {
            let take = keys.len().min(max_frames);
            &keys[keys.len() - take..]
        } else {
            &keys[keys.len() - 1..]
        }
    } else {
        &keys[..]
    };

    let mut batch = DiscoveryBatch::new(station);
    let mut new_last_key = last_key;

    for key in targets {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        new_last_key = key.clone();

        let filename = key.rsplit('/').next().unwrap_or(key);
        if should_skip_filename(filename) {
            continue;
        }
        let Some(timestamp) = derive_timestamp(filename) else {
            continue;
        };

        let all_stored = products.iter().all(|product| {
            shared
                .store
                .has_timestamp_product(station, product.as_str(), &timestamp)
        });
        if all_stored {
            continue;
        }

        batch.items.push(DiscoveryItem {
            station: station.to_string(),
            bucket: NEXRAD_BUCKET.to_string(),
            key: key.clone(),
            timestamp,
        });

        if batch.items.len() >= BATCH_SIZE {
            let full = std::mem::replace(&mut batch, DiscoveryBatch::new(station));
            enqueue_batch(shared, full);
        }
    }

    if !batch.items.is_empty() {
        enqueue_batch(shared, batch);
    }

    let mut stats = shared.stats.lock();
    let entry = stats.entry(station.to_string()).or_default();
    entry.last_processed_key = new_last_key;
    entry.last_scan_timestamp = now_nanos();
}

fn enqueue_batch(shared: &Arc<Shared>, batch: DiscoveryBatch) {
    debug!(
        "queueing batch of {} for {}",
        batch.items.len(),
        batch.station
    );
    let mut queue = shared.queue.lock();
    queue.push_back(batch);
    shared.queue_ready.notify_one();
}

// =============================================================================
// Dispatcher (fetch loop)
// =============================================================================

fn fetch_loop(shared: Arc<Shared>) {
    info!("fetch loop started");
    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() && !shared.should_stop.load(Ordering::SeqCst) {
                let _ = shared.queue_ready.wait_for(&mut queue, DISPATCH_WAIT);
            }
            if shared.should_stop.load(Ordering::SeqCst) {
                break;
            }
            match queue.pop_front() {
                Some(batch) => batch,
                None => continue,
            }
        };

        let config = shared.config.lock().clone();
        let (fetch_pool, buffers) = {
            let pools = shared.pools.lock();
            (Arc::clone(&pools.fetch), pools.buffers.clone())
        };

        // One task per batch: a station's volumes are large, and sequential
        // processing keeps them from contending for buffers.
        let shared_task = Arc::clone(&shared);
        fetch_pool.enqueue(move || {
            process_batch(&shared_task, &batch, &config, &buffers);
        });
    }
    info!("fetch loop stopped");
}

fn process_batch(
    shared: &Arc<Shared>,
    batch: &DiscoveryBatch,
    config: &IngestConfig,
    buffers: &BufferPool,
) {
    for item in &batch.items {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }

        let mut raw = buffers.acquire();
        match shared
            .objects
            .get_object(&item.bucket, &item.key, &mut raw)
        {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                error!("download failed for {}: {}", item.key, e);
                record_failure(shared, &item.station);
                continue;
            }
        }

        let mut decompressed = buffers.acquire();
        let frames = match decode_volume_multi(
            &raw,
            &item.station,
            &item.timestamp,
            &config.products,
            &mut decompressed,
        ) {
            Ok(frames) => frames,
            Err(e) => {
                error!("decode failed for {}: {}", item.key, e);
                record_failure(shared, &item.station);
                continue;
            }
        };
        // The download and decompression buffers go back to the pool before
        // the memory-hungry transcode starts.
        drop(decompressed);
        drop(raw);

        for (product, frame) in &frames {
            if shared.should_stop.load(Ordering::SeqCst) {
                break;
            }
            transcode_and_store(shared, item, *product, frame, buffers);
        }

        shared
            .last_fetch_timestamp
            .store(now_nanos(), Ordering::Relaxed);
    }
}

/// Rasterize and pack one decoded frame, handing each finished artifact to
/// the storage writer. Write tasks own their bitmask/value buffers, so only
/// the large grids come from the pool.
fn transcode_and_store(
    shared: &Arc<Shared>,
    item: &DiscoveryItem,
    product: Product,
    frame: &RadarFrame,
    buffers: &BufferPool,
) {
    if frame.available_tilts.is_empty() || frame.ngates == 0 || frame.gate_spacing_meters <= 0.0 {
        return;
    }

    let tilts = &frame.available_tilts;
    let num_gates = frame.ngates;
    let range = quant_range(product);

    // The voxel cap skipping the volumetric artifact is not an error;
    // per-tilt artifacts still persist.
    let mut volume_grid = match volume_cell_count(tilts.len(), num_gates) {
        Some(cells) => {
            let mut grid = buffers.acquire();
            grid.resize(cells, 0);
            Some(grid)
        }
        None => {
            debug!(
                "volumetric grid for {} {} exceeds the voxel cap; skipping volume",
                item.station, product
            );
            None
        }
    };

    for (tilt_idx, &tilt) in tilts.iter().enumerate() {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        let spec = grid_spec_for_tilt(frame, tilt);
        let cells = spec.num_rays as usize * num_gates as usize;

        let mut grid = buffers.acquire();
        grid.resize(cells, 0);

        rasterize_tilt(
            frame,
            tilt,
            range,
            spec,
            num_gates,
            &mut grid,
            volume_grid.as_mut().map(|g| g.as_mut_slice()),
            tilt_idx,
        );

        let mut mask = Vec::new();
        let mut values = Vec::new();
        bitmask::pack_into(&grid, &mut mask, &mut values);

        shared.store.enqueue_write(WriteTask::Tilt {
            station: item.station.clone(),
            product,
            timestamp: item.timestamp.clone(),
            tilt,
            num_rays: spec.num_rays,
            num_gates,
            gate_spacing: frame.gate_spacing_meters,
            first_gate: frame.first_gate_meters,
            bitmask: mask,
            values,
        });

        shared.frames_fetched.fetch_add(1, Ordering::Relaxed);
        let mut stats = shared.stats.lock();
        let entry = stats.entry(item.station.clone()).or_default();
        entry.frames_fetched += 1;
        entry.last_fetch_timestamp = now_nanos();
        entry.last_frame_timestamp = item.timestamp.clone();
    }

    if let Some(volume) = volume_grid {
        let mut mask = Vec::new();
        let mut values = Vec::new();
        bitmask::pack_into(&volume, &mut mask, &mut values);
        if !values.is_empty() {
            shared.store.enqueue_write(WriteTask::Volumetric {
                station: item.station.clone(),
                product,
                timestamp: item.timestamp.clone(),
                tilts: tilts.clone(),
                num_rays: VOLUME_RAYS,
                num_gates,
                gate_spacing: frame.gate_spacing_meters,
                first_gate: frame.first_gate_meters,
                bitmask: mask,
                values,
            });
        }
    }
}

fn record_failure(shared: &Arc<Shared>, station: &str) {
    shared.frames_failed.fetch_add(1, Ordering::Relaxed);
    let mut stats = shared.stats.lock();
    let entry = stats.entry(station.to_string()).or_default();
    entry.frames_failed += 1;
    entry.last_fetch_timestamp = now_nanos();
}

// =============================================================================
// Cleanup loop
// =============================================================================

fn cleanup_loop(shared: Arc<Shared>) {
    info!("cleanup loop started");
    while !shared.should_stop.load(Ordering::SeqCst) {
        let (enabled, interval, max_frames) = {
            let config = shared.config.lock();
            (
                config.auto_cleanup_enabled,
                config.cleanup_interval_seconds,
                config.max_frames_per_station,
            )
        };

        let deadline = Instant::now() + Duration::from_secs(interval);
        while Instant::now() < deadline && !shared.should_stop.load(Ordering::SeqCst) {
            std::thread::sleep(SHUTDOWN_POLL);
        }
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }

        if enabled {
            debug!("running periodic cleanup");
            shared.store.cleanup_old_frames(max_frames);
        }
    }
    info!("cleanup loop stopped");
}

fn now_nanos() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1000))
}

// =============================================================================
// Tests
// =============================================================================

//! The ingestion pipeline.
//!
//! ```text
//! scheduler ─▶ discovery pool ─▶ discovery queue ─▶ dispatcher ─▶ fetch pool
//!                                                                    │
//!                       object store GET ─▶ decode ─▶ transcode ─▶ store
//! ```
//!
//! Per-station watermarks persist across restarts; the buffer pool bounds
//! memory; reconfiguration swaps pools without dropping in-flight work.

pub mod buffer_pool;
pub mod config;
pub mod discovery;
pub mod ingestor;
pub mod worker_pool;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use config::{ConfigUpdate, IngestConfig, StationStats};
pub use discovery::{DiscoveryBatch, DiscoveryItem, ScanRegistry, ScopedScan};
pub use ingestor::Ingestor;
pub use worker_pool::WorkerPool;

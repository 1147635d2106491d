//! levelii - Continuous NEXRAD Level II ingestion and transcoding
//!
//! A long-running service that watches the public NEXRAD archive, downloads
//! each new volume once, decodes it, and persists compact bitmask artifacts
//! per tilt plus a combined volumetric grid.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Level II Fetcher                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐        │
//! │  │  Discovery   │───▶│    Fetch /   │───▶│    Frame     │        │
//! │  │   Scanner    │    │   Decode     │    │    Store     │        │
//! │  │  (S3 lists)  │    │  (pipeline)  │    │  (.RDA/gzip) │        │
//! │  └──────────────┘    └──────────────┘    └──────────────┘        │
//! │            watermarks        buffers            indices          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`decode`] - container decompression, message parsing, frame model
//! - [`transcode`] - quantization, grid rasterization, bitmask packing
//! - [`store`] - hierarchical artifact store with per-station indices
//! - [`pipeline`] - worker pools, discovery, and the ingestion loops
//! - [`object_store`] - the S3 port and its adapters
//! - [`admin`] - the HTTP control plane
//! - [`error`] - error types

pub mod admin;
pub mod decode;
pub mod error;
pub mod object_store;
pub mod pipeline;
pub mod store;
pub mod transcode;

// Re-export commonly used types
pub use decode::{decode_volume, decode_volume_multi, Product, RadarFrame};
pub use error::{Error, Result};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore, NEXRAD_BUCKET};
pub use pipeline::{ConfigUpdate, IngestConfig, Ingestor};
pub use store::FrameStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

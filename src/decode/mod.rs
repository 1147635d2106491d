//! NEXRAD Level II decoding.
//!
//! The path from raw object bytes to a structured frame:
//!
//! ```text
//! bytes ─▶ container (bzip2/LDM) ─▶ message scan ─▶ segmenter ─▶ RadarFrame
//! ```
//!
//! Everything here is defensive: inputs are treated as adversarial, and a
//! malformed radial or block is skipped rather than aborting the volume.

pub mod container;
pub mod frame;
pub mod geometry;
pub mod messages;
pub mod parser;
pub mod reader;
pub mod segmenter;
pub mod testdata;

pub use container::auto_decompress;
pub use frame::{Product, RadarFrame, Sweep};
pub use parser::{decode_volume, decode_volume_multi};

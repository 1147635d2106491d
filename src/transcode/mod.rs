//! Lossy transcoding of decoded frames into bitmask artifacts.
//!
//! Floating moments are quantized per product onto `u8` grids, then packed
//! as an MSB-first bitmask plus a parallel stream of the non-zero values.
//! The transcoder is intentionally lossy; fidelity is bounded by one
//! quantization step per product.

pub mod bitmask;
pub mod grid;
pub mod quant;

pub use bitmask::{pack, pack_into, unpack};
pub use grid::{
    gate_index, grid_spec_for_tilt, rasterize_tilt, ray_index, volume_cell_count, GridSpec,
    MAX_VOLUME_VOXELS, VOLUME_RAYS,
};
pub use quant::{dequantize, quant_range, quantize, QuantRange};

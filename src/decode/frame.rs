//! The decoded radar-frame model.
//!
//! A `RadarFrame` holds every radial of one product from one volume: ordered
//! sweeps with interleaved `(azimuth, range, value)` bin triples, plus the
//! site and scan metadata needed downstream by the transcoder and store.

use std::collections::HashMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Gate stride for optional uniform downsampling (1 = keep every gate).
pub const DOWNSAMPLE_GATES: usize = 1;

/// Reflectivity floor in dBZ; values below are treated as no-data.
pub const MIN_DBZ: f32 = -32.0;

/// Fallback maximum range when no radial reported one.
pub const DEFAULT_MAX_RANGE_METERS: f32 = 230_000.0;

// =============================================================================
// Product
// =============================================================================

/// The six base moments carried by Message 31 (Message 1 carries only
/// reflectivity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Reflectivity,
    Velocity,
    SpectrumWidth,
    DifferentialReflectivity,
    DifferentialPhase,
    #[serde(alias = "cross_correlation_ratio")]
    CorrelationCoefficient,
}

impl Product {
    pub fn as_str(&self) -> &'static str {
        match self {
            Product::Reflectivity => "reflectivity",
            Product::Velocity => "velocity",
            Product::SpectrumWidth => "spectrum_width",
            Product::DifferentialReflectivity => "differential_reflectivity",
            Product::DifferentialPhase => "differential_phase",
            Product::CorrelationCoefficient => "correlation_coefficient",
        }
    }

    /// Parse a product tag, accepting the legacy alias for RhoHV.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reflectivity" => Some(Product::Reflectivity),
            "velocity" => Some(Product::Velocity),
            "spectrum_width" => Some(Product::SpectrumWidth),
            "differential_reflectivity" => Some(Product::DifferentialReflectivity),
            "differential_phase" => Some(Product::DifferentialPhase),
            "correlation_coefficient" | "cross_correlation_ratio" => {
                Some(Product::CorrelationCoefficient)
            }
            _ => None,
        }
    }

    /// True when a Message 31 moment block with this name carries the
    /// product. `SW ` is space-padded on the wire, so only its first two
    /// bytes are significant.
    pub fn matches_block_name(&self, name: &[u8; 3]) -> bool {
        match self {
            Product::Reflectivity => name == b"REF",
            Product::Velocity => name == b"VEL",
            Product::SpectrumWidth => &name[..2] == b"SW",
            Product::DifferentialReflectivity => name == b"ZDR",
            Product::DifferentialPhase => name == b"PHI",
            Product::CorrelationCoefficient => name == b"RHO",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// PRF Mode
// =============================================================================

/// Pulse repetition frequency mode recorded for velocity dealiasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrfMode {
    #[default]
    Fixed,
    Staggered,
    Hybrid,
}

// =============================================================================
// Sweep
// =============================================================================

/// One full rotation at a fixed elevation.
///
/// Bins are stored as a flat `(azimuth_deg, range_m, value)` triple stream in
/// radial-arrival order; the stream dominates frame size, so it is the only
/// data copied out of the pooled decompression buffers.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    /// 0-based index in volume order
    pub index: usize,
    /// Elevation number from Message 31 (zero for Message 1 volumes)
    pub elevation_num: u8,
    pub elevation_deg: f32,
    pub ray_count: u32,
    pub nyquist_velocity: f32,
    pub bins: Vec<f32>,
}

impl Sweep {
    pub fn new(index: usize, elevation_num: u8, elevation_deg: f32) -> Self {
        Sweep {
            index,
            elevation_num,
            elevation_deg,
            ray_count: 0,
            nyquist_velocity: 0.0,
            // A dense sweep carries on the order of 60k bins
            bins: Vec::with_capacity(60_000 * 3),
        }
    }

    pub fn push_bin(&mut self, azimuth_deg: f32, range_m: f32, value: f32) {
        self.bins.push(azimuth_deg);
        self.bins.push(range_m);
        self.bins.push(value);
    }

    /// Iterate bins as `(azimuth, range, value)` triples.
    pub fn iter_bins(&self) -> impl Iterator<Item = (f32, f32, f32)> + '_ {
        self.bins.chunks_exact(3).map(|c| (c[0], c[1], c[2]))
    }
}

// =============================================================================
// RadarFrame
// =============================================================================

/// All decoded radials of one product from one volume file.
#[derive(Debug, Clone)]
pub struct RadarFrame {
    pub station: String,
    /// `%Y%m%d_%H%M%S`, from the volume header
    pub timestamp: String,
    pub product: Product,

    pub radar_lat: f64,
    pub radar_lon: f64,
    pub radar_height_asl_meters: f32,

    pub vcp_number: u16,
    pub unambiguous_range_meters: f32,
    pub max_range_meters: f32,
    pub prf_mode: PrfMode,

    /// Nyquist velocity per elevation, keyed by [`tilt_key`]
    pub nyquist_velocity: HashMap<i32, f32>,
    /// Logged ray count per elevation, keyed by [`tilt_key`]
    pub sweep_ray_counts: HashMap<i32, u32>,

    pub sweeps: Vec<Sweep>,
    /// Sorted unique sweep elevations, filled by `finalize`
    pub available_tilts: Vec<f32>,

    pub ngates: u16,
    pub gate_spacing_meters: f32,
    pub first_gate_meters: f32,
    pub nrays: u32,

    /// 4/3-earth point cloud as `[x, y, z, value]` runs, filled by the
    /// geometry pass
    pub volumetric_points: Vec<f32>,
}

impl RadarFrame {
    pub fn new(station: &str, timestamp: &str, product: Product) -> Self {
        RadarFrame {
            station: station.to_string(),
            timestamp: timestamp.to_string(),
            product,
            radar_lat: 0.0,
            radar_lon: 0.0,
            radar_height_asl_meters: 0.0,
            vcp_number: 0,
            unambiguous_range_meters: 0.0,
            max_range_meters: 0.0,
            prf_mode: PrfMode::default(),
            nyquist_velocity: HashMap::new(),
            sweep_ray_counts: HashMap::new(),
            sweeps: Vec::new(),
            available_tilts: Vec::new(),
            ngates: 0,
            gate_spacing_meters: 0.0,
            first_gate_meters: 0.0,
            nrays: 0,
            volumetric_points: Vec::new(),
        }
    }

    /// Latch frame-level gate geometry from the first substantial moment
    /// block (tiny gate counts are clutter-filter artifacts).
    pub fn latch_gate_geometry(&mut self, ngates: u16, spacing_m: f32, first_gate_m: f32) {
        if self.ngates == 0 && ngates > 10 {
            self.ngates = ngates;
            self.gate_spacing_meters = spacing_m;
            self.first_gate_meters = first_gate_m;
        }
    }

    /// Total bins across all sweeps.
    pub fn bin_count(&self) -> usize {
        self.sweeps.iter().map(|s| s.bins.len() / 3).sum()
    }

    /// Sort and dedupe `available_tilts` and apply range fallbacks. Called
    /// once after decoding completes.
    pub fn finalize(&mut self, total_radials: u32) {
        self.available_tilts = self.sweeps.iter().map(|s| s.elevation_deg).collect();
        self.available_tilts
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.available_tilts.dedup();

        if self.max_range_meters <= 0.0 {
            self.max_range_meters = DEFAULT_MAX_RANGE_METERS;
        }
        if self.unambiguous_range_meters <= 0.0 {
            self.unambiguous_range_meters = DEFAULT_MAX_RANGE_METERS;
        }
        self.nrays = total_radials;
        for sweep in &mut self.sweeps {
            sweep.bins.shrink_to_fit();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Canonical map key for per-elevation metadata; collisions within 0.005
/// degrees are intentional.
#[inline]
pub fn tilt_key(elevation_deg: f32) -> i32 {
    (elevation_deg * 100.0).round() as i32
}

/// Round a dequantized value to one decimal for display precision. This is
/// orthogonal to the storage quantization in the transcoder.
#[inline]
pub fn round_display(value: f32) -> f32 {
    (value * 10.0).round() * 0.1
}

/// Render a volume-header date as `%Y%m%d_%H%M%S`. The NEXRAD Julian day is
/// 1-based: day 1 is 1970-01-01.
pub fn format_timestamp(julian_day: u32, milliseconds: u32) -> String {
    let secs = (julian_day as i64 - 1) * 86_400 + (milliseconds as i64 / 1000);
    match DateTime::from_timestamp(secs, (milliseconds % 1000) * 1_000_000) {
        Some(dt) => dt.format("%Y%m%d_%H%M%S").to_string(),
        None => String::from("19700101_000000"),
    }
}

// =============================================================================
// Tests
// =============================================================================

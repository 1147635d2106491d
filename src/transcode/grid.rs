//! Rasterization of radar bins into 2D tilt grids and the 3D volume grid.
//!
//! Per-tilt grids adapt their ray count to the sweep (720 for split-cut
//! super-resolution sweeps, 360 otherwise). The volumetric grid is always
//! 720 rays wide; bins from 360-ray sweeps are doubled into the adjacent
//! ray so the volume stays fully populated.

use crate::decode::frame::{tilt_key, RadarFrame};
use crate::transcode::quant::{quantize, QuantRange};

/// Ray count of the volumetric grid.
pub const VOLUME_RAYS: u16 = 720;

/// Azimuth resolution factor of the volumetric grid.
pub const VOLUME_RESOLUTION: f32 = 2.0;

/// Hard safety cap on volumetric grid cells (~200 MB).
pub const MAX_VOLUME_VOXELS: usize = 200_000_000;

/// Sweeps whose logged ray count exceeds this rasterize at 720 rays.
const SUPER_RESOLUTION_THRESHOLD: u32 = 400;

/// Tolerance when matching sweep elevations to a tilt.
const TILT_MATCH_EPSILON: f32 = 0.01;

/// Ray layout chosen for one tilt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub num_rays: u16,
    pub resolution_factor: f32,
}

/// Pick the 2D ray layout for a tilt from the frame's logged ray counts.
pub fn grid_spec_for_tilt(frame: &RadarFrame, tilt: f32) -> GridSpec {
    let logged = frame
        .sweep_ray_counts
        .get(&tilt_key(tilt))
        .copied()
        .unwrap_or(0);
    if logged > SUPER_RESOLUTION_THRESHOLD {
        GridSpec {
            num_rays: 720,
            resolution_factor: 2.0,
        }
    } else {
        GridSpec {
            num_rays: 360,
            resolution_factor: 1.0,
        }
    }
}

/// Gate index for a range, or `None` for bins before the first gate or past
/// `num_gates`.
#[inline]
pub fn gate_index(range_m: f32, first_gate_m: f32, spacing_m: f32, num_gates: u16) -> Option<usize> {
    let idx = ((range_m - first_gate_m) / spacing_m).floor() as i64;
    if idx < 0 || idx >= num_gates as i64 {
        return None;
    }
    Some(idx as usize)
}

/// Ray index for an azimuth at a resolution factor; positive azimuths wrap,
/// the epsilon absorbs float error at exact ray boundaries.
#[inline]
pub fn ray_index(azimuth_deg: f32, resolution_factor: f32, num_rays: u16) -> usize {
    let num_rays = num_rays as i64;
    let mut idx = (azimuth_deg * resolution_factor + 0.01).floor() as i64 % num_rays;
    if idx < 0 {
        idx += num_rays;
    }
    idx as usize
}

/// Total cell count of the volumetric grid for a frame, if it fits under the
/// voxel cap.
pub fn volume_cell_count(num_tilts: usize, num_gates: u16) -> Option<usize> {
    let cells = num_tilts
        .checked_mul(VOLUME_RAYS as usize)?
        .checked_mul(num_gates as usize)?;
    if cells == 0 || cells > MAX_VOLUME_VOXELS {
        return None;
    }
    Some(cells)
}

/// Rasterize one tilt of a frame.
///
/// Writes quantized bins into `grid_2d` (`spec.num_rays x num_gates`,
/// row-major) and, when `volume` is provided, accumulates the same bins into
/// the tilt's section of the volumetric grid. Collisions keep the maximum.
/// 360-ray sweeps also write the `+1 mod 720` neighbor ray in the volume so
/// halved azimuth sampling still fills it.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_tilt(
    frame: &RadarFrame,
    tilt: f32,
    range: QuantRange,
    spec: GridSpec,
    num_gates: u16,
    grid_2d: &mut [u8],
    mut volume: Option<&mut [u8]>,
    tilt_idx: usize,
) {
    debug_assert_eq!(grid_2d.len(), spec.num_rays as usize * num_gates as usize);

    let gates = num_gates as usize;
    let volume_tilt_base = tilt_idx * VOLUME_RAYS as usize * gates;

    for sweep in &frame.sweeps {
        if (sweep.elevation_deg - tilt).abs() >= TILT_MATCH_EPSILON {
            continue;
        }
        for (azimuth, range_m, value) in sweep.iter_bins() {
            let code = quantize(value, range);
            if code == 0 {
                continue;
            }
            let gate = match gate_index(range_m, frame.first_gate_meters, frame.gate_spacing_meters, num_gates)
            {
                Some(g) => g,
                None => continue,
            };

            let ray_2d = ray_index(azimuth, spec.resolution_factor, spec.num_rays);
            let idx_2d = ray_2d * gates + gate;
            if idx_2d < grid_2d.len() {
                grid_2d[idx_2d] = grid_2d[idx_2d].max(code);
            }

            if let Some(volume) = volume.as_deref_mut() {
                let ray_3d = ray_index(azimuth, VOLUME_RESOLUTION, VOLUME_RAYS);
                let idx_3d = volume_tilt_base + ray_3d * gates + gate;
                if idx_3d < volume.len() {
                    volume[idx_3d] = volume[idx_3d].max(code);
                    if spec.resolution_factor < 1.5 {
                        let adjacent = (ray_3d + 1) % VOLUME_RAYS as usize;
                        let adj_idx = volume_tilt_base + adjacent * gates + gate;
                        if adj_idx < volume.len() {
                            volume[adj_idx] = volume[adj_idx].max(code);
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Earth-relative bin coordinates under the 4/3-earth refraction model.
//!
//! Microwave rays bend with the atmospheric refractivity gradient; inflating
//! the earth radius by 4/3 linearizes standard refraction so beam height and
//! ground distance reduce to closed-form trigonometry.

use crate::decode::frame::RadarFrame;

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f32 = 6_371_000.0;

/// Effective radius under the 4/3 model.
const EFFECTIVE_RADIUS_M: f32 = EARTH_RADIUS_M * (4.0 / 3.0);

/// Values at or below this are no-data markers, not echoes.
const NO_DATA_FLOOR: f32 = -100.0;

/// Convert every bin of every sweep to earth-relative `(x, y, z, value)`
/// runs, appended to `frame.volumetric_points`.
///
/// `x` is east, `y` north, `z` height above the radar. Azimuth sin/cos are
/// cached across consecutive bins of the same radial, which dominate the
/// stream.
pub fn generate_point_cloud(frame: &mut RadarFrame) {
    frame.volumetric_points.clear();
    if frame.sweeps.is_empty() {
        return;
    }
    frame.volumetric_points.reserve(frame.bin_count() * 4);

    let radar_height = frame.radar_height_asl_meters;
    let base = EFFECTIVE_RADIUS_M + radar_height;
    let base_sq = base * base;

    for sweep in &frame.sweeps {
        let elevation_rad = sweep.elevation_deg.to_radians();
        let cos_elev = elevation_rad.cos();
        let sin_elev = elevation_rad.sin();
        let two_base_sin_elev = 2.0 * base * sin_elev;

        let mut last_azimuth = f32::NAN;
        let mut sin_az = 0.0f32;
        let mut cos_az = 0.0f32;

        for (azimuth_deg, range_m, value) in sweep.iter_bins() {
            if value <= NO_DATA_FLOOR {
                continue;
            }

            if azimuth_deg != last_azimuth {
                let azimuth_rad = azimuth_deg.to_radians();
                sin_az = azimuth_rad.sin();
                cos_az = azimuth_rad.cos();
                last_azimuth = azimuth_deg;
            }

            let height_asl =
                (range_m * range_m + base_sq + range_m * two_base_sin_elev).sqrt()
                    - EFFECTIVE_RADIUS_M;

            let arg = ((range_m * cos_elev) / (EFFECTIVE_RADIUS_M + height_asl)).clamp(-1.0, 1.0);
            let ground_distance = EFFECTIVE_RADIUS_M * arg.asin();

            frame.volumetric_points.push(ground_distance * sin_az);
            frame.volumetric_points.push(ground_distance * cos_az);
            frame.volumetric_points.push(height_asl - radar_height);
            frame.volumetric_points.push(value);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

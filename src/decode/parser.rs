//! The Level II frame decoder.
//!
//! Walks a decompressed Archive II stream and produces one [`RadarFrame`]
//! per requested product. Messages are packed into 2432-byte slots with a
//! 12-byte CTM preamble, except Message 31 and Message 29 which are
//! size-accurate and may span slots; the decoder probes candidate offsets
//! with the header validity predicate instead of trusting slot alignment.
//!
//! Every per-field validation failure discards only the offending radial or
//! block; scanning always resumes. Arbitrary input must never panic here.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::decode::container::auto_decompress;
use crate::decode::frame::{
    format_timestamp, round_display, tilt_key, Product, RadarFrame, Sweep, DOWNSAMPLE_GATES,
    MIN_DBZ,
};
use crate::decode::geometry::generate_point_cloud;
use crate::decode::messages::{
    DataBlock, Message31Header, MessageHeader, RadialStatus, VolumeHeader, MESSAGE_HEADER_SIZE,
    VOLUME_HEADER_SIZE,
};
use crate::decode::reader::read_u16_be;
use crate::decode::segmenter::MessageSegmenter;
use crate::error::{Error, Result};

/// NEXRAD slot size on the Archive II stream.
const SLOT_SIZE: usize = 2432;

/// CTM preamble length at the start of each slot.
const CTM_PREAMBLE: usize = 12;

/// Metadata slot count at the head of an Archive II file.
const METADATA_SLOTS: usize = 134;

/// Hard cap on messages examined per volume.
const MAX_MESSAGES: usize = 200_000;

/// How far the decoder hunts forward for a valid header in Archive II mode.
const MAX_HEADER_SCAN: usize = 4096;

/// Messages below this size still occupy a full slot (all but types 31/29).
const SLOT_RESIDENT_MAX: usize = 2420;

// =============================================================================
// Public entry points
// =============================================================================

/// Decode one volume for a single product.
pub fn decode_volume(
    data: &[u8],
    station_hint: &str,
    timestamp_hint: &str,
    product: Product,
) -> Result<RadarFrame> {
    let mut scratch = Vec::new();
    let mut frames = decode_volume_multi(
        data,
        station_hint,
        timestamp_hint,
        &[product],
        &mut scratch,
    )?;
    frames.remove(&product).ok_or(Error::EmptyFrame)
}

/// Decode one volume for several products in a single pass.
///
/// `decompressed` is the caller-leased scratch buffer that receives the
/// expanded container; passing a pooled buffer keeps large allocations out
/// of the per-volume path. Fails with [`Error::EmptyFrame`] when not a
/// single valid radial was decoded for any requested product.
pub fn decode_volume_multi(
    data: &[u8],
    station_hint: &str,
    timestamp_hint: &str,
    products: &[Product],
    decompressed: &mut Vec<u8>,
) -> Result<HashMap<Product, RadarFrame>> {
    let mut decoder = Decoder::new(station_hint, timestamp_hint, products);

    if data.len() >= VOLUME_HEADER_SIZE {
        if let Ok(header) = VolumeHeader::parse(data) {
            decoder.apply_volume_header(&header);
        }
    }

    auto_decompress(data, decompressed)?;
    decoder.scan(decompressed);
    decoder.into_frames()
}

// =============================================================================
// Decoder
// =============================================================================

struct Decoder {
    frames: HashMap<Product, RadarFrame>,
    segmenter: MessageSegmenter,

    current_sweep: Option<usize>,
    current_elev_num: u8,
    current_sweep_elevation: f32,

    radial_count: u32,
    message_count: usize,
}

impl Decoder {
    fn new(station_hint: &str, timestamp_hint: &str, products: &[Product]) -> Self {
        let mut frames = HashMap::with_capacity(products.len());
        for &product in products {
            frames.insert(product, RadarFrame::new(station_hint, timestamp_hint, product));
        }
        Decoder {
            frames,
            segmenter: MessageSegmenter::new(),
            current_sweep: None,
            current_elev_num: 0xFF,
            current_sweep_elevation: -99.0,
            radial_count: 0,
            message_count: 0,
        }
    }

    fn apply_volume_header(&mut self, header: &VolumeHeader) {
        if header.radar_id.len() != 4 || !header.radar_id.bytes().all(|b| b.is_ascii_uppercase()) {
            return;
        }
        let timestamp = format_timestamp(header.julian_date, header.milliseconds);
        for frame in self.frames.values_mut() {
            frame.station = header.radar_id.clone();
            frame.timestamp = timestamp.clone();
        }
    }

    fn into_frames(mut self) -> Result<HashMap<Product, RadarFrame>> {
        if self.radial_count == 0 {
            return Err(Error::EmptyFrame);
        }
        for frame in self.frames.values_mut() {
            frame.finalize(self.radial_count);
            if !frame.sweeps.is_empty() {
                generate_point_cloud(frame);
            }
        }
        Ok(self.frames)
    }

    // -------------------------------------------------------------------------
    // Stream walk
    // -------------------------------------------------------------------------

    fn scan(&mut self, data: &[u8]) {
        let mut offset = 0usize;
        let is_archive2 = VolumeHeader::has_archive2_magic(data);

        if is_archive2 {
            if let Ok(header) = VolumeHeader::parse(data) {
                self.apply_volume_header(&header);
            }
            offset = VOLUME_HEADER_SIZE;
            offset = self.seed_metadata_region(data, offset);
        }

        while offset + MESSAGE_HEADER_SIZE <= data.len() && self.message_count < MAX_MESSAGES {
            if is_archive2 {
                while offset < data.len() && data[offset] == 0 {
                    offset += 1;
                }
            }
            if offset + MESSAGE_HEADER_SIZE > data.len() {
                break;
            }

            let header_offset = match self.probe_header(data, offset, is_archive2) {
                Some(found) => found,
                None => {
                    offset += 1;
                    continue;
                }
            };

            let header = match MessageHeader::parse(data, header_offset) {
                Ok(h) => h,
                Err(_) => break,
            };
            let message_size = header.size_bytes();
            if message_size < MESSAGE_HEADER_SIZE
                || header_offset + message_size > data.len()
            {
                offset = header_offset + 1;
                continue;
            }

            let payload = &data[header_offset + MESSAGE_HEADER_SIZE..header_offset + message_size];

            // Slot-resident messages advance by the slot payload stride;
            // size-accurate types 31/29 advance by their own length.
            offset = header_offset + message_size;
            if is_archive2
                && message_size < SLOT_RESIDENT_MAX
                && header.msg_type != 31
                && header.msg_type != 29
            {
                offset = header_offset + (SLOT_SIZE - CTM_PREAMBLE);
            }

            let assembled = match self.segmenter.add_segment(&header, payload) {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.message_count += 1;
                    continue;
                }
                Err(e) => {
                    debug!("segment rejected: {}", e);
                    self.message_count += 1;
                    continue;
                }
            };

            match assembled.msg_type {
                1 => self.handle_message1(&assembled.data),
                31 => self.handle_message31(&assembled.data),
                other => trace!("skipping message type {}", other),
            }
            self.message_count += 1;
        }
    }

    /// Feed the 134 fixed metadata slots through the segmenter so that
    /// continuation segments arriving later in the stream find their
    /// partners, then skip past the region.
    fn seed_metadata_region(&mut self, data: &[u8], offset: usize) -> usize {
        let region_len = METADATA_SLOTS * SLOT_SIZE;
        if offset + region_len > data.len() {
            return offset;
        }
        for slot in 0..METADATA_SLOTS {
            let slot_offset = offset + slot * SLOT_SIZE;
            let header = match MessageHeader::parse(data, slot_offset + CTM_PREAMBLE) {
                Ok(h) => h,
                Err(_) => continue,
            };
            if header.msg_type == 0 {
                continue;
            }
            let payload_start = slot_offset + CTM_PREAMBLE + MESSAGE_HEADER_SIZE;
            let payload_len = SLOT_SIZE - CTM_PREAMBLE - MESSAGE_HEADER_SIZE;
            if payload_start + payload_len <= data.len() {
                let _ = self
                    .segmenter
                    .add_segment(&header, &data[payload_start..payload_start + payload_len]);
            }
        }
        offset + region_len
    }

    /// Probe `{offset, offset + 12}` for a valid header, then hunt linearly
    /// up to 4 KiB forward in Archive II mode.
    fn probe_header(&self, data: &[u8], offset: usize, is_archive2: bool) -> Option<usize> {
        for skip in [0usize, CTM_PREAMBLE] {
            let at = offset + skip;
            if at + MESSAGE_HEADER_SIZE > data.len() {
                continue;
            }
            if let Ok(header) = MessageHeader::parse(data, at) {
                if header.is_valid() {
                    return Some(at);
                }
            }
        }
        if is_archive2 {
            for skip in 1..=MAX_HEADER_SCAN {
                let at = offset + skip;
                if at + MESSAGE_HEADER_SIZE > data.len() {
                    break;
                }
                if let Ok(header) = MessageHeader::parse(data, at) {
                    if header.is_valid() {
                        return Some(at);
                    }
                }
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Sweep management
    // -------------------------------------------------------------------------

    fn open_sweep(&mut self, elevation_deg: f32, elev_num: u8) {
        let index = self.current_sweep.map(|i| i + 1).unwrap_or(0);
        self.current_sweep = Some(index);
        self.current_elev_num = elev_num;
        self.current_sweep_elevation = elevation_deg;
        for frame in self.frames.values_mut() {
            frame.sweeps.push(Sweep::new(index, elev_num, elevation_deg));
        }
    }

    fn record_radial(&mut self) {
        let key = tilt_key(self.current_sweep_elevation);
        for frame in self.frames.values_mut() {
            *frame.sweep_ray_counts.entry(key).or_insert(0) += 1;
            if let Some(idx) = self.current_sweep {
                if let Some(sweep) = frame.sweeps.get_mut(idx) {
                    sweep.ray_count += 1;
                }
            }
        }
        self.radial_count += 1;
    }

    // -------------------------------------------------------------------------
    // Message 1: legacy digital radar data
    // -------------------------------------------------------------------------

    fn handle_message1(&mut self, payload: &[u8]) {
        if payload.len() < 32 {
            return;
        }
        let azimuth = match read_u16_be(payload, 8) {
            Ok(raw) => raw as f32 * (360.0 / 65536.0),
            Err(_) => return,
        };
        let elevation = match read_u16_be(payload, 16) {
            Ok(raw) => raw as f32 * (360.0 / 65536.0),
            Err(_) => return,
        };
        if !(-0.1..=360.1).contains(&azimuth) || !(-5.0..=90.0).contains(&elevation) {
            return;
        }

        let radial_status = RadialStatus::from_raw(payload[1]);
        if radial_status.starts_sweep() || self.current_sweep.is_none() {
            self.open_sweep(elevation, 0);
        }
        let sweep_idx = match self.current_sweep {
            Some(idx) => idx,
            None => return,
        };
        self.record_radial();

        if payload.len() < 46 {
            return;
        }
        let key = tilt_key(self.current_sweep_elevation);
        let unamb_raw = read_u16_be(payload, 26).unwrap_or(0);
        let nyquist_raw = read_u16_be(payload, 28).unwrap_or(0);
        let num_gates = read_u16_be(payload, 24).unwrap_or(0);
        let first_gate_m = read_u16_be(payload, 20).unwrap_or(0) as f32;
        let gate_size_m = read_u16_be(payload, 22).unwrap_or(0) as f32;

        for frame in self.frames.values_mut() {
            if frame.product != Product::Reflectivity {
                continue;
            }
            if unamb_raw > 0 {
                frame.unambiguous_range_meters = unamb_raw as f32 * 100.0;
                frame.max_range_meters =
                    frame.max_range_meters.max(frame.unambiguous_range_meters);
            }
            if nyquist_raw > 0 {
                let nyquist = nyquist_raw as f32 * 0.1;
                frame.nyquist_velocity.insert(key, nyquist);
                frame.sweeps[sweep_idx].nyquist_velocity = nyquist;
            }

            if num_gates == 0 || payload.len() < 46 + num_gates as usize {
                continue;
            }
            frame.latch_gate_geometry(num_gates, gate_size_m, first_gate_m);

            let gate_data = &payload[46..46 + num_gates as usize];
            let sweep = &mut frame.sweeps[sweep_idx];
            let mut g = 0usize;
            while g < num_gates as usize {
                let raw = gate_data[g];
                let gate_index = g;
                g += DOWNSAMPLE_GATES;
                // raw 0/1 are below-SNR and range-folded codes
                if raw <= 1 {
                    continue;
                }
                let value = (raw as f32 - 66.0) * 0.5;
                if value < MIN_DBZ {
                    continue;
                }
                let range_m = first_gate_m + gate_index as f32 * gate_size_m;
                sweep.push_bin(azimuth, range_m, round_display(value));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message 31: generic digital radar data
    // -------------------------------------------------------------------------

    fn handle_message31(&mut self, payload: &[u8]) {
        let m31 = match Message31Header::parse(payload) {
            Ok(h) => h,
            Err(e) => {
                debug!("discarding radial: {}", e);
                return;
            }
        };

        let azimuth = m31.azimuth_angle;
        let elevation = m31.elev_angle;
        if !azimuth.is_finite()
            || !elevation.is_finite()
            || !(-0.1..=360.1).contains(&azimuth)
            || !(-5.0..=90.0).contains(&elevation)
        {
            return;
        }

        let is_new_sweep = m31.radial_status.starts_sweep()
            || self.current_sweep.is_none()
            || (m31.elev_number != self.current_elev_num && self.current_sweep.is_some());

        if is_new_sweep {
            if m31.radial_status == RadialStatus::StartVolume {
                self.segmenter.clear();
            }
            self.open_sweep(elevation, m31.elev_number);
        }
        let sweep_idx = match self.current_sweep {
            Some(idx) => idx,
            None => return,
        };
        self.record_radial();
        let key = tilt_key(self.current_sweep_elevation);

        for &pointer in &m31.block_pointers {
            let block = match DataBlock::parse(payload, pointer as usize) {
                Ok(block) => block,
                Err(e) => {
                    trace!("skipping block: {}", e);
                    continue;
                }
            };
            match block {
                DataBlock::Volume(vol) => {
                    for frame in self.frames.values_mut() {
                        frame.vcp_number = vol.vcp_number;
                        frame.radar_lat = vol.lat as f64;
                        frame.radar_lon = vol.lon as f64;
                        frame.radar_height_asl_meters = vol.site_height_meters as f32;
                    }
                }
                DataBlock::Radial(rad) => {
                    for frame in self.frames.values_mut() {
                        if rad.nyquist_velocity_raw > 0 {
                            let nyquist = rad.nyquist_velocity();
                            frame.nyquist_velocity.insert(key, nyquist);
                            frame.sweeps[sweep_idx].nyquist_velocity = nyquist;
                        }
                        if rad.unambiguous_range_raw > 0 {
                            frame.unambiguous_range_meters = rad.unambiguous_range_meters();
                            frame.max_range_meters =
                                frame.max_range_meters.max(frame.unambiguous_range_meters);
                        }
                    }
                }
                DataBlock::Moment(moment) => {
                    for frame in self.frames.values_mut() {
                        if !frame.product.matches_block_name(&moment.name) {
                            continue;
                        }
                        frame.latch_gate_geometry(
                            moment.num_gates,
                            moment.gate_spacing_meters,
                            moment.first_gate_meters,
                        );

                        let is_reflectivity = frame.product == Product::Reflectivity;
                        let sweep = &mut frame.sweeps[sweep_idx];
                        let mut g = 0usize;
                        while g < moment.num_gates as usize {
                            let raw = moment.raw_sample(payload, g);
                            let gate_index = g;
                            g += DOWNSAMPLE_GATES;
                            if raw <= 1 {
                                continue;
                            }
                            let value = moment.dequantize(raw);
                            if is_reflectivity && value < MIN_DBZ {
                                continue;
                            }
                            let range_m = moment.first_gate_meters
                                + gate_index as f32 * moment.gate_spacing_meters;
                            sweep.push_bin(azimuth, range_m, round_display(value));
                        }
                    }
                }
                DataBlock::Elevation | DataBlock::Other => {}
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testdata::{
        m31_radial, m31_radial_with_block_count, synthetic_volume, RadialSpec,
    };

    fn products_all() -> Vec<Product> {
        vec![Product::Reflectivity, Product::Velocity]
    }

    #[test]
    fn test_decode_synthetic_volume() {
        let data = synthetic_volume(
            "KTLX",
            35,
            &[
                RadialSpec::new(0, 0.5, 0.0, RadialStatus::StartVolume),
                RadialSpec::new(0, 0.5, 1.0, RadialStatus::Intermediate),
                RadialSpec::new(1, 1.5, 0.0, RadialStatus::StartElevation),
                RadialSpec::new(1, 1.5, 1.0, RadialStatus::Intermediate),
            ],
        );

        let frame = decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity)
            .expect("volume decodes");

        assert_eq!(frame.station, "KTLX");
        assert_eq!(frame.vcp_number, 35);
        assert_eq!(frame.sweeps.len(), 2);
        assert_eq!(frame.available_tilts, vec![0.5, 1.5]);
        assert!((frame.first_gate_meters - 2125.0).abs() < 1.0);
        assert!(frame.bin_count() > 0);
        assert_eq!(frame.nrays, 4);
    }

    #[test]
    fn test_decode_multi_product_shares_identity() {
        let data = synthetic_volume(
            "KCRP",
            215,
            &[
                RadialSpec::new(0, 0.5, 10.0, RadialStatus::StartVolume),
                RadialSpec::new(1, 1.5, 10.0, RadialStatus::StartElevation),
            ],
        );

        let mut scratch = Vec::new();
        let frames = decode_volume_multi(
            &data,
            "XXXX",
            "19700101_000000",
            &products_all(),
            &mut scratch,
        )
        .unwrap();

        assert_eq!(frames.len(), 2);
        let reflectivity = &frames[&Product::Reflectivity];
        let velocity = &frames[&Product::Velocity];
        assert_eq!(reflectivity.station, velocity.station);
        assert_eq!(reflectivity.timestamp, velocity.timestamp);
        assert!(reflectivity.bin_count() > 0);
        assert!(velocity.bin_count() > 0);
        assert_eq!(reflectivity.vcp_number, 215);
    }

    #[test]
    fn test_available_tilts_sorted_unique() {
        let data = synthetic_volume(
            "KEWX",
            12,
            &[
                RadialSpec::new(0, 3.1, 0.0, RadialStatus::StartVolume),
                RadialSpec::new(1, 0.5, 0.0, RadialStatus::StartElevation),
                RadialSpec::new(2, 1.8, 0.0, RadialStatus::StartElevation),
            ],
        );
        let frame =
            decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();

        let tilts = &frame.available_tilts;
        assert!(tilts.windows(2).all(|w| w[0] < w[1]), "tilts strictly increasing");
        assert_eq!(tilts.len(), 3);
    }

    #[test]
    fn test_bin_angles_in_range() {
        let data = synthetic_volume(
            "KTLX",
            35,
            &[
                RadialSpec::new(0, 0.5, 359.9, RadialStatus::StartVolume),
                RadialSpec::new(0, 0.5, 45.0, RadialStatus::Intermediate),
            ],
        );
        let frame =
            decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();

        for sweep in &frame.sweeps {
            assert!((-5.0..=90.0).contains(&sweep.elevation_deg));
            for (azimuth, _, _) in sweep.iter_bins() {
                assert!((0.0..360.1).contains(&azimuth));
            }
        }
    }

    #[test]
    fn test_huge_block_count_rejected_without_crash() {
        let mut radials = vec![m31_radial(&RadialSpec::new(
            0,
            0.5,
            0.0,
            RadialStatus::StartVolume,
        ))];
        // Crafted radial claiming 0xFFFF data blocks
        radials.push(m31_radial_with_block_count(0xFFFF));

        let data = crate::decode::testdata::wrap_archive2("KTLX", &radials);
        let frame = decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity)
            .expect("good radial still decodes");

        // Only the valid radial contributed
        assert_eq!(frame.nrays, 1);
    }

    #[test]
    fn test_arbitrary_bytes_never_panic() {
        // Deterministic xorshift noise; covers the null vector too
        let mut state = 0x2545F491_4F6CDD1Du64;
        let mut noise = vec![0u8; 256 * 1024];
        for byte in noise.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *byte = state as u8;
        }

        for input in [&noise[..], &[][..], &[0u8; 4096][..]] {
            let mut scratch = Vec::new();
            let _ = decode_volume_multi(
                input,
                "KTLX",
                "19700101_000000",
                &products_all(),
                &mut scratch,
            );
        }
    }

    #[test]
    fn test_empty_volume_is_empty_frame_error() {
        // A volume header with no radials behind it
        let data = crate::decode::testdata::wrap_archive2("KTLX", &[]);
        assert!(matches!(
            decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity),
            Err(Error::EmptyFrame)
        ));
    }
}

//! Wire-format record views for the Level II message stream.
//!
//! Layouts follow ICD 2620010: all records are packed with no padding and all
//! multi-byte fields are big-endian. Rather than transmuting packed structs,
//! every field is read explicitly through the byte reader, which handles
//! endianness and alignment identically on every platform.

use crate::decode::reader::{
    read_f32_be, read_i16_be, read_u16_be, read_u32_be, read_u8, safe_pointer_dereference,
};
use crate::error::{Error, Result};

/// Size of the Archive II volume header.
pub const VOLUME_HEADER_SIZE: usize = 24;

/// Size of the message header preceding every message.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Fixed portion of the Message 31 header, before the block pointer array.
pub const MESSAGE31_FIXED_SIZE: usize = 32;

/// Size of the common data-block header (tag byte + 3-byte name).
pub const DATA_BLOCK_HEADER_SIZE: usize = 4;

/// Size of the `VOL` data block.
pub const VOLUME_BLOCK_SIZE: usize = 44;

/// Size of the `RAD` data block.
pub const RADIAL_BLOCK_SIZE: usize = 20;

/// Fixed portion of a moment (`'D'`) data block, before the gate data.
pub const MOMENT_BLOCK_HEADER_SIZE: usize = 28;

/// Maximum data blocks a Message 31 may carry.
pub const MAX_BLOCK_COUNT: u16 = 100;

// =============================================================================
// Radial Status
// =============================================================================

/// Radial status values carried by Message 1 and Message 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RadialStatus {
    StartElevation = 0,
    Intermediate = 1,
    EndElevation = 2,
    StartVolume = 3,
    EndVolume = 4,
    StartElevationSegmented = 5,
    Unknown = 0xFF,
}

impl RadialStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RadialStatus::StartElevation,
            1 => RadialStatus::Intermediate,
            2 => RadialStatus::EndElevation,
            3 => RadialStatus::StartVolume,
            4 => RadialStatus::EndVolume,
            5 => RadialStatus::StartElevationSegmented,
            _ => RadialStatus::Unknown,
        }
    }

    /// True for the statuses that open a new sweep.
    pub fn starts_sweep(&self) -> bool {
        matches!(
            self,
            RadialStatus::StartElevation
                | RadialStatus::StartVolume
                | RadialStatus::StartElevationSegmented
        )
    }
}

// =============================================================================
// Volume Header
// =============================================================================

/// The 24-byte header at the start of every Archive II file.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    /// Archive II filename field (version tag + extension)
    pub filename: [u8; 12],
    /// NEXRAD-modified Julian date, 1-based from 1970-01-01
    pub julian_date: u32,
    /// Milliseconds past midnight
    pub milliseconds: u32,
    /// Four-character ICAO radar identifier
    pub radar_id: String,
}

impl VolumeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VOLUME_HEADER_SIZE {
            return Err(Error::Truncated {
                offset: 0,
                needed: VOLUME_HEADER_SIZE,
                available: data.len(),
            });
        }
        let mut filename = [0u8; 12];
        filename.copy_from_slice(&data[..12]);
        let radar_id = String::from_utf8_lossy(&data[20..24])
            .trim_end_matches('\0')
            .to_string();
        Ok(VolumeHeader {
            filename,
            julian_date: read_u32_be(data, 12)?,
            milliseconds: read_u32_be(data, 16)?,
            radar_id,
        })
    }

    /// True when the buffer begins with an Archive II magic string.
    pub fn has_archive2_magic(data: &[u8]) -> bool {
        data.len() >= VOLUME_HEADER_SIZE
            && (data.starts_with(b"ARCHIVE2") || data.starts_with(b"AR2V"))
    }
}

// =============================================================================
// Message Header
// =============================================================================

/// The 16-byte header preceding every message on the stream.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    /// Message size in 16-bit halfwords, including this header
    pub size_halfwords: u16,
    pub rda_channel: u8,
    pub msg_type: u8,
    pub sequence_num: u16,
    pub julian_date: u16,
    pub milliseconds: u32,
    pub num_segments: u16,
    pub segment_num: u16,
}

impl MessageHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(MessageHeader {
            size_halfwords: read_u16_be(data, offset)?,
            rda_channel: read_u8(data, offset + 2)?,
            msg_type: read_u8(data, offset + 3)?,
            sequence_num: read_u16_be(data, offset + 4)?,
            julian_date: read_u16_be(data, offset + 6)?,
            milliseconds: read_u32_be(data, offset + 8)?,
            num_segments: read_u16_be(data, offset + 12)?,
            segment_num: read_u16_be(data, offset + 14)?,
        })
    }

    /// Validity predicate used to locate headers inside slot-packed data.
    pub fn is_valid(&self) -> bool {
        self.msg_type > 0
            && self.msg_type <= 32
            && self.size_halfwords >= 8
            && self.size_halfwords < 32768
            && self.julian_date > 10000
    }

    /// Full message size in bytes, header included.
    pub fn size_bytes(&self) -> usize {
        self.size_halfwords as usize * 2
    }
}

// =============================================================================
// Message 31 Header
// =============================================================================

/// Fixed header of a Message 31 (generic digital radar data) payload, plus
/// the variable array of absolute data-block pointers that follows it.
#[derive(Debug, Clone)]
pub struct Message31Header {
    pub radar_id: [u8; 4],
    pub collection_time: u32,
    pub collection_date: u16,
    pub azimuth_number: u16,
    pub azimuth_angle: f32,
    pub radial_status: RadialStatus,
    pub elev_number: u8,
    pub elev_angle: f32,
    pub block_count: u16,
    pub block_pointers: Vec<u32>,
}

impl Message31Header {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < MESSAGE31_FIXED_SIZE {
            return Err(Error::Truncated {
                offset: 0,
                needed: MESSAGE31_FIXED_SIZE,
                available: payload.len(),
            });
        }
        let block_count = read_u16_be(payload, 30)?;
        if block_count > MAX_BLOCK_COUNT {
            return Err(Error::InvalidHeader(format!(
                "block count {} exceeds {}",
                block_count, MAX_BLOCK_COUNT
            )));
        }
        let mut block_pointers = Vec::with_capacity(block_count as usize);
        for b in 0..block_count as usize {
            block_pointers.push(read_u32_be(payload, MESSAGE31_FIXED_SIZE + b * 4)?);
        }
        let mut radar_id = [0u8; 4];
        radar_id.copy_from_slice(&payload[..4]);
        Ok(Message31Header {
            radar_id,
            collection_time: read_u32_be(payload, 4)?,
            collection_date: read_u16_be(payload, 8)?,
            azimuth_number: read_u16_be(payload, 10)?,
            azimuth_angle: read_f32_be(payload, 12)?,
            radial_status: RadialStatus::from_raw(read_u8(payload, 21)?),
            elev_number: read_u8(payload, 22)?,
            elev_angle: read_f32_be(payload, 24)?,
            block_count,
            block_pointers,
        })
    }
}

// =============================================================================
// Data Blocks
// =============================================================================

/// Data blocks dispatched by their one-byte tag and three-byte name.
#[derive(Debug)]
pub enum DataBlock {
    /// `VOL`: site coordinates, height, calibration, VCP number
    Volume(VolumeBlock),
    /// `ELV`: per-elevation metadata
    Elevation,
    /// `RAD`: unambiguous range and Nyquist velocity
    Radial(RadialBlock),
    /// Any `'D'` block: a radar moment
    Moment(MomentBlock),
    /// Recognized layout but irrelevant content
    Other,
}

impl DataBlock {
    /// Parse the block at `offset` inside a Message 31 payload, validating
    /// the pointer before every dereference.
    pub fn parse(payload: &[u8], offset: usize) -> Result<Self> {
        if !safe_pointer_dereference(offset, DATA_BLOCK_HEADER_SIZE, payload.len()) {
            return Err(Error::PointerOutOfRange {
                offset,
                payload_len: payload.len(),
            });
        }
        let tag = payload[offset];
        let name = &payload[offset + 1..offset + 4];
        match name {
            b"VOL" => {
                if !safe_pointer_dereference(offset, VOLUME_BLOCK_SIZE, payload.len()) {
                    return Err(Error::PointerOutOfRange {
                        offset,
                        payload_len: payload.len(),
                    });
                }
                Ok(DataBlock::Volume(VolumeBlock::parse(payload, offset)?))
            }
            b"ELV" => Ok(DataBlock::Elevation),
            b"RAD" => {
                if !safe_pointer_dereference(offset, RADIAL_BLOCK_SIZE, payload.len()) {
                    return Err(Error::PointerOutOfRange {
                        offset,
                        payload_len: payload.len(),
                    });
                }
                Ok(DataBlock::Radial(RadialBlock::parse(payload, offset)?))
            }
            _ if tag == b'D' => {
                if !safe_pointer_dereference(offset, MOMENT_BLOCK_HEADER_SIZE, payload.len()) {
                    return Err(Error::PointerOutOfRange {
                        offset,
                        payload_len: payload.len(),
                    });
                }
                Ok(DataBlock::Moment(MomentBlock::parse(payload, offset)?))
            }
            _ => Ok(DataBlock::Other),
        }
    }
}

/// `VOL` data block: site metadata and the volume coverage pattern.
#[derive(Debug, Clone, Copy)]
pub struct VolumeBlock {
    pub lat: f32,
    pub lon: f32,
    pub site_height_meters: i16,
    pub feedhorn_height_meters: u16,
    pub calibration: f32,
    pub vcp_number: u16,
}

impl VolumeBlock {
    fn parse(payload: &[u8], offset: usize) -> Result<Self> {
        Ok(VolumeBlock {
            lat: read_f32_be(payload, offset + 8)?,
            lon: read_f32_be(payload, offset + 12)?,
            site_height_meters: read_i16_be(payload, offset + 16)?,
            feedhorn_height_meters: read_u16_be(payload, offset + 18)?,
            calibration: read_f32_be(payload, offset + 20)?,
            vcp_number: read_u16_be(payload, offset + 40)?,
        })
    }
}

/// `RAD` data block: per-radial range and velocity metadata.
#[derive(Debug, Clone, Copy)]
pub struct RadialBlock {
    /// Unambiguous range, raw units of 100 m
    pub unambiguous_range_raw: u16,
    pub noise_h: f32,
    pub noise_v: f32,
    /// Nyquist velocity, raw units of 0.01 m/s
    pub nyquist_velocity_raw: u16,
}

impl RadialBlock {
    fn parse(payload: &[u8], offset: usize) -> Result<Self> {
        Ok(RadialBlock {
            unambiguous_range_raw: read_u16_be(payload, offset + 6)?,
            noise_h: read_f32_be(payload, offset + 8)?,
            noise_v: read_f32_be(payload, offset + 12)?,
            nyquist_velocity_raw: read_u16_be(payload, offset + 16)?,
        })
    }

    pub fn unambiguous_range_meters(&self) -> f32 {
        self.unambiguous_range_raw as f32 * 100.0
    }

    pub fn nyquist_velocity(&self) -> f32 {
        self.nyquist_velocity_raw as f32 * 0.01
    }
}

/// A moment (`'D'`) data block header with its raw gate data window.
#[derive(Debug, Clone)]
pub struct MomentBlock {
    /// Three-character moment name: `REF`, `VEL`, `SW `, `ZDR`, `PHI`, `RHO`
    pub name: [u8; 3],
    pub num_gates: u16,
    pub first_gate_meters: f32,
    pub gate_spacing_meters: f32,
    pub threshold: u16,
    pub control_flags: u16,
    pub data_word_size: u8,
    pub scale: f32,
    pub offset: f32,
    /// Byte range of the raw gate data inside the payload
    pub data_offset: usize,
}

impl MomentBlock {
    fn parse(payload: &[u8], offset: usize) -> Result<Self> {
        let mut name = [0u8; 3];
        name.copy_from_slice(&payload[offset + 1..offset + 4]);

        let num_gates = read_u16_be(payload, offset + 8)?;
        let first_gate = read_u16_be(payload, offset + 10)? as f32;
        let gate_spacing = read_u16_be(payload, offset + 12)? as f32;
        let raw_word_size = read_u8(payload, offset + 18)?;
        // A zero word size is recorded by some RDA builds; treat it as 8-bit.
        let data_word_size = if raw_word_size == 0 { 8 } else { raw_word_size };

        if num_gates == 0 || num_gates > 8000 {
            return Err(Error::UnsupportedMoment(format!(
                "gate count {} out of range",
                num_gates
            )));
        }
        if gate_spacing == 0.0 {
            return Err(Error::UnsupportedMoment("zero gate spacing".into()));
        }
        if data_word_size != 8 && data_word_size != 16 {
            return Err(Error::UnsupportedMoment(format!(
                "word size {} not in {{8, 16}}",
                data_word_size
            )));
        }

        let data_offset = offset + MOMENT_BLOCK_HEADER_SIZE;
        let data_len = num_gates as usize * (data_word_size as usize / 8);
        if !safe_pointer_dereference(data_offset, data_len, payload.len()) {
            return Err(Error::PointerOutOfRange {
                offset: data_offset,
                payload_len: payload.len(),
            });
        }

        Ok(MomentBlock {
            name,
            num_gates,
            first_gate_meters: first_gate,
            gate_spacing_meters: gate_spacing,
            threshold: read_u16_be(payload, offset + 14)?,
            control_flags: read_u16_be(payload, offset + 16)?,
            data_word_size,
            scale: read_f32_be(payload, offset + 20)?,
            offset: read_f32_be(payload, offset + 24)?,
            data_offset,
        })
    }

    /// Raw gate sample at index `g`, widened to u16 for 8-bit words.
    #[inline]
    pub fn raw_sample(&self, payload: &[u8], g: usize) -> u16 {
        if self.data_word_size == 16 {
            let at = self.data_offset + g * 2;
            u16::from_be_bytes([payload[at], payload[at + 1]])
        } else {
            payload[self.data_offset + g] as u16
        }
    }

    /// Dequantize a raw sample into physical units.
    #[inline]
    pub fn dequantize(&self, raw: u16) -> f32 {
        (raw as f32 - self.offset) / self.scale
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(msg_type: u8, size_hw: u16, julian: u16) -> Vec<u8> {
        let mut h = vec![0u8; MESSAGE_HEADER_SIZE];
        h[0..2].copy_from_slice(&size_hw.to_be_bytes());
        h[3] = msg_type;
        h[6..8].copy_from_slice(&julian.to_be_bytes());
        h
    }

    #[test]
    fn test_message_header_validity() {
        let ok = MessageHeader::parse(&header_bytes(31, 100, 20000), 0).unwrap();
        assert!(ok.is_valid());
        assert_eq!(ok.size_bytes(), 200);

        assert!(!MessageHeader::parse(&header_bytes(0, 100, 20000), 0)
            .unwrap()
            .is_valid());
        assert!(!MessageHeader::parse(&header_bytes(33, 100, 20000), 0)
            .unwrap()
            .is_valid());
        assert!(!MessageHeader::parse(&header_bytes(31, 7, 20000), 0)
            .unwrap()
            .is_valid());
        assert!(!MessageHeader::parse(&header_bytes(31, 32768, 20000), 0)
            .unwrap()
            .is_valid());
        assert!(!MessageHeader::parse(&header_bytes(31, 100, 9999), 0)
            .unwrap()
            .is_valid());
    }

    #[test]
    fn test_volume_header() {
        let mut data = vec![0u8; VOLUME_HEADER_SIZE];
        data[..8].copy_from_slice(b"AR2V0006");
        data[12..16].copy_from_slice(&19000u32.to_be_bytes());
        data[16..20].copy_from_slice(&43_200_000u32.to_be_bytes());
        data[20..24].copy_from_slice(b"KTLX");

        let header = VolumeHeader::parse(&data).unwrap();
        assert_eq!(header.radar_id, "KTLX");
        assert_eq!(header.julian_date, 19000);
        assert!(VolumeHeader::has_archive2_magic(&data));

        assert!(VolumeHeader::parse(&data[..10]).is_err());
    }

    #[test]
    fn test_message31_block_count_guard() {
        let mut payload = vec![0u8; 128];
        payload[30..32].copy_from_slice(&0xFFFFu16.to_be_bytes());
        assert!(matches!(
            Message31Header::parse(&payload),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_message31_pointer_array() {
        let mut payload = vec![0u8; 64];
        payload[30..32].copy_from_slice(&2u16.to_be_bytes());
        payload[32..36].copy_from_slice(&40u32.to_be_bytes());
        payload[36..40].copy_from_slice(&52u32.to_be_bytes());
        let m31 = Message31Header::parse(&payload).unwrap();
        assert_eq!(m31.block_pointers, vec![40, 52]);
    }

    #[test]
    fn test_moment_block_rejects_bad_word_size() {
        let mut payload = vec![0u8; 256];
        let off = 32;
        payload[off] = b'D';
        payload[off + 1..off + 4].copy_from_slice(b"REF");
        payload[off + 8..off + 10].copy_from_slice(&10u16.to_be_bytes());
        payload[off + 12..off + 14].copy_from_slice(&250u16.to_be_bytes());
        payload[off + 18] = 12; // neither 8 nor 16
        assert!(matches!(
            DataBlock::parse(&payload, off),
            Err(Error::UnsupportedMoment(_))
        ));
    }

    #[test]
    fn test_moment_block_rejects_truncated_data() {
        let mut payload = vec![0u8; 40];
        let off = 8;
        payload[off] = b'D';
        payload[off + 1..off + 4].copy_from_slice(b"VEL");
        payload[off + 8..off + 10].copy_from_slice(&100u16.to_be_bytes());
        payload[off + 12..off + 14].copy_from_slice(&250u16.to_be_bytes());
        payload[off + 18] = 8;
        // 100 gates cannot fit in a 40-byte payload
        assert!(matches!(
            DataBlock::parse(&payload, off),
            Err(Error::PointerOutOfRange { .. })
        ));
    }

    #[test]
    fn test_radial_status_sweep_starts() {
        assert!(RadialStatus::StartElevation.starts_sweep());
        assert!(RadialStatus::StartVolume.starts_sweep());
        assert!(RadialStatus::StartElevationSegmented.starts_sweep());
        assert!(!RadialStatus::Intermediate.starts_sweep());
        assert!(!RadialStatus::EndVolume.starts_sweep());
    }
}

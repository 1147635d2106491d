//! Synthetic Archive II volume builders.
//!
//! Constructs minimal but wire-accurate Message 31 volumes for exercising
//! the decoder and pipeline without network access. Each radial carries a
//! `VOL`, `RAD`, `REF`, and `VEL` block with realistic scale/offset pairs.

use crate::decode::messages::{RadialStatus, MESSAGE_HEADER_SIZE};

/// Julian day of 2024-01-01 (1-based from 1970-01-01).
const TEST_JULIAN_DAY: u32 = 19724;

/// Gate count per synthetic radial; large enough to latch frame geometry.
pub const TEST_GATES: u16 = 16;

/// First-gate range of the synthetic moment blocks, in meters.
pub const TEST_FIRST_GATE: u16 = 2125;

/// Gate spacing of the synthetic moment blocks, in meters.
pub const TEST_GATE_SPACING: u16 = 250;

/// Fixed on-wire size of each synthetic message, header included.
const MESSAGE_SIZE: usize = 512;

/// One radial of a synthetic volume.
#[derive(Debug, Clone, Copy)]
pub struct RadialSpec {
    pub elev_number: u8,
    pub elevation_deg: f32,
    pub azimuth_deg: f32,
    pub status: RadialStatus,
    pub vcp: u16,
}

impl RadialSpec {
    pub fn new(elev_number: u8, elevation_deg: f32, azimuth_deg: f32, status: RadialStatus) -> Self {
        RadialSpec {
            elev_number,
            elevation_deg,
            azimuth_deg,
            status,
            vcp: 35,
        }
    }
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_f32(buf: &mut [u8], at: usize, v: f32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

fn moment_block(buf: &mut Vec<u8>, name: &[u8; 3], scale: f32, offset: f32, fill: u8) {
    let at = buf.len();
    buf.resize(at + 28 + TEST_GATES as usize, 0);
    buf[at] = b'D';
    buf[at + 1..at + 4].copy_from_slice(name);
    put_u16(buf, at + 8, TEST_GATES);
    put_u16(buf, at + 10, TEST_FIRST_GATE);
    put_u16(buf, at + 12, TEST_GATE_SPACING);
    buf[at + 18] = 8; // word size
    put_f32(buf, at + 20, scale);
    put_f32(buf, at + 24, offset);
    for g in 0..TEST_GATES as usize {
        buf[at + 28 + g] = fill.wrapping_add(g as u8);
    }
}

/// Build one complete, size-accurate Message 31 (header included).
pub fn m31_radial(spec: &RadialSpec) -> Vec<u8> {
    // Payload: 32-byte fixed header, 4 block pointers, VOL + RAD + REF + VEL
    let mut payload = vec![0u8; 48];
    payload[..4].copy_from_slice(b"KTLX");
    put_f32(&mut payload, 12, spec.azimuth_deg);
    payload[21] = spec.status as u8;
    payload[22] = spec.elev_number;
    put_f32(&mut payload, 24, spec.elevation_deg);
    put_u16(&mut payload, 30, 4);

    // VOL block
    let vol_at = payload.len();
    payload.resize(vol_at + 44, 0);
    payload[vol_at] = b'V';
    payload[vol_at + 1..vol_at + 4].copy_from_slice(b"VOL");
    put_f32(&mut payload, vol_at + 8, 35.333);
    put_f32(&mut payload, vol_at + 12, -97.278);
    put_u16(&mut payload, vol_at + 16, 370u16); // site height (i16)
    put_u16(&mut payload, vol_at + 40, spec.vcp);

    // RAD block
    let rad_at = payload.len();
    payload.resize(rad_at + 20, 0);
    payload[rad_at] = b'R';
    payload[rad_at + 1..rad_at + 4].copy_from_slice(b"RAD");
    put_u16(&mut payload, rad_at + 6, 2300); // 230 km unambiguous range
    put_u16(&mut payload, rad_at + 16, 2795); // 27.95 m/s Nyquist

    let ref_at = payload.len();
    moment_block(&mut payload, b"REF", 2.0, 66.0, 120);
    let vel_at = payload.len();
    moment_block(&mut payload, b"VEL", 2.0, 129.0, 100);

    put_u32(&mut payload, 32, vol_at as u32);
    put_u32(&mut payload, 36, rad_at as u32);
    put_u32(&mut payload, 40, ref_at as u32);
    put_u32(&mut payload, 44, vel_at as u32);

    // Real Message 31 payloads run to a kilobyte and beyond; pad to a fixed
    // 512-byte message so sizes stay representative.
    payload.resize(MESSAGE_SIZE - MESSAGE_HEADER_SIZE, 0);

    let mut message = vec![0u8; MESSAGE_HEADER_SIZE];
    put_u16(&mut message, 0, (MESSAGE_SIZE / 2) as u16);
    message[3] = 31;
    put_u16(&mut message, 6, 20000); // julian date passes the validity predicate
    put_u16(&mut message, 12, 1); // single segment
    put_u16(&mut message, 14, 1);
    message.extend_from_slice(&payload);
    message
}

/// A structurally valid Message 31 whose payload claims an absurd block
/// count. The decoder must discard it and keep scanning.
pub fn m31_radial_with_block_count(block_count: u16) -> Vec<u8> {
    let mut payload = vec![0u8; MESSAGE_SIZE - MESSAGE_HEADER_SIZE];
    payload[..4].copy_from_slice(b"KTLX");
    put_f32(&mut payload, 12, 10.0);
    put_f32(&mut payload, 24, 0.5);
    put_u16(&mut payload, 30, block_count);

    let mut message = vec![0u8; MESSAGE_HEADER_SIZE];
    put_u16(&mut message, 0, (MESSAGE_SIZE / 2) as u16);
    message[3] = 31;
    put_u16(&mut message, 6, 20000);
    put_u16(&mut message, 12, 1);
    put_u16(&mut message, 14, 1);
    message.extend_from_slice(&payload);
    message
}

/// Wrap pre-built messages in a 24-byte Archive II volume header.
pub fn wrap_archive2(station: &str, messages: &[Vec<u8>]) -> Vec<u8> {
    let mut data = vec![0u8; 24];
    data[..8].copy_from_slice(b"AR2V0006");
    put_u32(&mut data, 12, TEST_JULIAN_DAY);
    put_u32(&mut data, 16, 0);
    data[20..24].copy_from_slice(&station.as_bytes()[..4]);
    for message in messages {
        data.extend_from_slice(message);
    }
    data
}

/// Build a complete synthetic volume from radial specs.
pub fn synthetic_volume(station: &str, vcp: u16, radials: &[RadialSpec]) -> Vec<u8> {
    let messages: Vec<Vec<u8>> = radials
        .iter()
        .map(|spec| {
            let mut spec = *spec;
            spec.vcp = vcp;
            m31_radial(&spec)
        })
        .collect();
    wrap_archive2(station, &messages)
}

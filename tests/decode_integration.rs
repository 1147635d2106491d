//! End-to-end decoder tests: container handling through frame production.

use bzip2::read::BzEncoder;
use bzip2::Compression;
use std::io::Read;

use levelii::decode::messages::{RadialStatus, VOLUME_HEADER_SIZE};
use levelii::decode::testdata::{m31_radial, synthetic_volume, wrap_archive2, RadialSpec};
use levelii::decode::{auto_decompress, decode_volume, decode_volume_multi};
use levelii::{Error, Product};

fn bz2(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(data, Compression::best());
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).unwrap();
    compressed
}

/// Wrap a synthetic volume the way the archive actually ships it: volume
/// header, then LDM records of bzip2-compressed message runs.
fn ldm_wrap(volume: &[u8]) -> Vec<u8> {
    let (header, messages) = volume.split_at(VOLUME_HEADER_SIZE);
    let compressed = bz2(messages);

    let mut data = header.to_vec();
    data.extend_from_slice(&(-(compressed.len() as i32)).to_be_bytes());
    data.extend_from_slice(&compressed);
    data
}

fn standard_radials() -> Vec<RadialSpec> {
    vec![
        RadialSpec::new(1, 0.5, 0.0, RadialStatus::StartVolume),
        RadialSpec::new(1, 0.5, 1.0, RadialStatus::Intermediate),
        RadialSpec::new(1, 0.5, 2.0, RadialStatus::Intermediate),
        RadialSpec::new(2, 1.5, 0.0, RadialStatus::StartElevation),
        RadialSpec::new(2, 1.5, 1.0, RadialStatus::Intermediate),
        RadialSpec::new(3, 2.4, 0.0, RadialStatus::StartElevation),
    ]
}

#[test]
fn ldm_wrapped_volume_decodes_like_plain() {
    let plain = synthetic_volume("KTLX", 35, &standard_radials());
    let wrapped = ldm_wrap(&plain);

    let from_plain =
        decode_volume(&plain, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();
    let from_ldm =
        decode_volume(&wrapped, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();

    assert_eq!(from_plain.station, "KTLX");
    assert_eq!(from_ldm.station, from_plain.station);
    assert_eq!(from_ldm.timestamp, from_plain.timestamp);
    assert_eq!(from_ldm.available_tilts, from_plain.available_tilts);
    assert_eq!(from_ldm.bin_count(), from_plain.bin_count());
    assert_eq!(from_ldm.nrays, 6);
}

#[test]
fn known_good_volume_metadata() {
    let data = synthetic_volume("KTLX", 35, &standard_radials());
    let frame = decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();

    assert_eq!(frame.station, "KTLX");
    assert_eq!(frame.vcp_number, 35);
    assert!(!frame.available_tilts.is_empty());
    assert!((frame.first_gate_meters - 2125.0).abs() < 1.0);
    assert!(frame.unambiguous_range_meters > 0.0);
    // Site metadata comes from the VOL block
    assert!((frame.radar_lat - 35.333).abs() < 0.01);
    assert!((frame.radar_lon - -97.278).abs() < 0.01);
}

#[test]
fn multi_product_single_pass() {
    let data = synthetic_volume("KCRP", 215, &standard_radials());
    let mut scratch = Vec::new();
    let frames = decode_volume_multi(
        &data,
        "XXXX",
        "19700101_000000",
        &[Product::Reflectivity, Product::Velocity],
        &mut scratch,
    )
    .unwrap();

    assert_eq!(frames.len(), 2);
    let reflectivity = &frames[&Product::Reflectivity];
    let velocity = &frames[&Product::Velocity];

    assert_eq!(reflectivity.station, "KCRP");
    assert_eq!(reflectivity.station, velocity.station);
    assert_eq!(reflectivity.timestamp, velocity.timestamp);
    assert_eq!(reflectivity.vcp_number, 215);
    assert!(reflectivity.sweeps.iter().any(|s| !s.bins.is_empty()));
}

#[test]
fn many_tilts_decode_distinct() {
    let mut radials = Vec::new();
    for (i, tilt) in [
        0.5f32, 0.9, 1.3, 1.8, 2.4, 3.1, 4.0, 5.1, 6.4, 8.0, 10.0, 12.5, 15.6, 19.5,
    ]
    .iter()
    .enumerate()
    {
        radials.push(RadialSpec::new(
            (i + 1) as u8,
            *tilt,
            0.0,
            if i == 0 {
                RadialStatus::StartVolume
            } else {
                RadialStatus::StartElevation
            },
        ));
    }
    let data = synthetic_volume("KCRP", 215, &radials);
    let frame = decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();

    assert_eq!(frame.vcp_number, 215);
    assert!(frame.available_tilts.len() >= 14);
    assert!(frame
        .available_tilts
        .windows(2)
        .all(|pair| pair[0] < pair[1]));
}

#[test]
fn short_passthrough_buffer_unchanged() {
    let data: Vec<u8> = (0u8..16).collect();
    let mut out = Vec::new();
    auto_decompress(&data, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn corrupt_radial_does_not_poison_volume() {
    let mut messages: Vec<Vec<u8>> = standard_radials().iter().map(m31_radial).collect();
    // Truncate one message in the middle of the stream
    messages[2].truncate(40);
    let data = wrap_archive2("KTLX", &messages);

    // The decoder recovers: remaining radials still decode
    let frame = decode_volume(&data, "XXXX", "19700101_000000", Product::Reflectivity).unwrap();
    assert!(frame.nrays >= 3);
}

#[test]
fn arbitrary_large_noise_never_panics() {
    let mut state = 0x9E3779B97F4A7C15u64;
    let mut noise = vec![0u8; 1024 * 1024];
    for byte in noise.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
    // Make it look superficially like an archive so every path runs
    noise[..8].copy_from_slice(b"AR2V0006");

    let mut scratch = Vec::new();
    let result = decode_volume_multi(
        &noise,
        "KTLX",
        "19700101_000000",
        &[Product::Reflectivity],
        &mut scratch,
    );
    // Any outcome is fine as long as it does not panic
    if let Err(e) = result {
        assert!(matches!(e, Error::EmptyFrame | Error::CorruptContainer(_)));
    }
}

//! On-disk artifact framing and gzip codec.
//!
//! An `.RDA` artifact is `[u32 LE metadata_len][metadata JSON][bitmask]
//! [values]`, gzip-compressed as a whole. The compact single-letter metadata
//! keys keep per-file overhead small across millions of artifacts.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Artifact metadata header.
///
/// `e` is the tilt for per-tilt artifacts and omitted for volumes; `tilts`
/// is the reverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Station
    pub s: String,
    /// Product tag
    pub p: String,
    /// Timestamp (`%Y%m%d_%H%M%S`)
    pub t: String,
    /// Tilt in degrees (per-tilt artifacts only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<f32>,
    /// Format tag, always `"b"` for bitmask
    pub f: String,
    /// Tilt list (volumetric artifacts only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tilts: Option<Vec<f32>>,
    /// Ray count
    pub r: u16,
    /// Gate count
    pub g: u16,
    /// Gate spacing in meters
    pub gs: f32,
    /// First-gate range in meters
    pub fg: f32,
    /// Non-zero value count
    pub v: usize,
}

/// A decoded artifact: metadata plus its two packed byte streams.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub metadata: ArtifactMeta,
    pub bitmask: Vec<u8>,
    pub values: Vec<u8>,
}

/// Whole-buffer gzip at best compression, matching the write pipeline.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Whole-buffer gzip decompression.
pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize and compress an artifact into its on-disk bytes.
pub fn encode(metadata: &ArtifactMeta, bitmask: &[u8], values: &[u8]) -> Result<Vec<u8>> {
    let metadata_json = serde_json::to_vec(metadata)
        .map_err(|e| Error::ConfigInvalid(format!("metadata serialization: {}", e)))?;

    let mut raw = Vec::with_capacity(4 + metadata_json.len() + bitmask.len() + values.len());
    raw.extend_from_slice(&(metadata_json.len() as u32).to_le_bytes());
    raw.extend_from_slice(&metadata_json);
    raw.extend_from_slice(bitmask);
    raw.extend_from_slice(values);

    gzip_compress(&raw)
}

/// Decompress and split artifact bytes back into their three components.
///
/// The bitmask length is derived from the ray/gate counts in the metadata;
/// the remainder of the payload is the value stream.
pub fn decode(data: &[u8]) -> Result<Artifact> {
    let raw = gzip_decompress(data)?;
    if raw.len() < 4 {
        return Err(Error::Truncated {
            offset: 0,
            needed: 4,
            available: raw.len(),
        });
    }
    let metadata_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if 4 + metadata_len > raw.len() {
        return Err(Error::Truncated {
            offset: 4,
            needed: metadata_len,
            available: raw.len() - 4,
        });
    }

    let metadata: ArtifactMeta = serde_json::from_slice(&raw[4..4 + metadata_len])
        .map_err(|e| Error::ConfigInvalid(format!("artifact metadata: {}", e)))?;

    let cell_count = if let Some(tilts) = &metadata.tilts {
        tilts.len() * metadata.r as usize * metadata.g as usize
    } else {
        metadata.r as usize * metadata.g as usize
    };
    let bitmask_len = (cell_count + 7) / 8;

    let body = &raw[4 + metadata_len..];
    if body.len() < bitmask_len {
        return Err(Error::Truncated {
            offset: 4 + metadata_len,
            needed: bitmask_len,
            available: body.len(),
        });
    }

    Ok(Artifact {
        bitmask: body[..bitmask_len].to_vec(),
        values: body[bitmask_len..].to_vec(),
        metadata,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tilt_meta() -> ArtifactMeta {
        ArtifactMeta {
            s: "KTLX".into(),
            p: "reflectivity".into(),
            t: "20240101_123456".into(),
            e: Some(0.5),
            f: "b".into(),
            tilts: None,
            r: 8,
            g: 4,
            gs: 250.0,
            fg: 2125.0,
            v: 3,
        }
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"compressible payload ".repeat(50);
        let compressed = gzip_compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(gzip_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_artifact_roundtrip_byte_identical() {
        let meta = tilt_meta();
        let bitmask = vec![0b1010_0000u8, 0, 0, 0];
        let values = vec![200u8, 117, 9];

        let encoded = encode(&meta, &bitmask, &values).unwrap();
        let artifact = decode(&encoded).unwrap();

        assert_eq!(artifact.metadata, meta);
        assert_eq!(artifact.bitmask, bitmask);
        assert_eq!(artifact.values, values);
    }

    #[test]
    fn test_volumetric_meta_roundtrip() {
        let mut meta = tilt_meta();
        meta.e = None;
        meta.tilts = Some(vec![0.5, 1.5, 2.4]);
        meta.r = 720;
        meta.g = 2;

        let cell_count = 3 * 720 * 2;
        let bitmask = vec![0u8; (cell_count + 7) / 8];
        let encoded = encode(&meta, &bitmask, &[]).unwrap();
        let artifact = decode(&encoded).unwrap();

        assert_eq!(artifact.metadata.tilts, Some(vec![0.5, 1.5, 2.4]));
        assert!(artifact.metadata.e.is_none());
        assert_eq!(artifact.bitmask.len(), bitmask.len());
    }

    #[test]
    fn test_tilt_key_omitted_in_json() {
        let mut meta = tilt_meta();
        meta.e = None;
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("\"e\""));
        assert!(!json.contains("tilts"));
    }

    #[test]
    fn test_decode_rejects_bad_metadata_len() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1000u32.to_le_bytes());
        raw.extend_from_slice(b"{}");
        let compressed = gzip_compress(&raw).unwrap();
        assert!(matches!(
            decode(&compressed),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_gzip() {
        assert!(decode(b"definitely not gzip").is_err());
    }
}

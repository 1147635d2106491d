//! Container auto-detection and decompression.
//!
//! Level II volumes arrive in one of three shapes: raw bzip2 (`"BZ"` magic),
//! an LDM-wrapped file (24-byte volume header followed by
//! `[i32 BE control word][bzip2 block]` records), or already-uncompressed
//! data. The output always begins with the 24-byte volume header followed by
//! the concatenated decompressed payloads in record order.

use bzip2::{Decompress, Status};
use tracing::debug;

use crate::decode::messages::VOLUME_HEADER_SIZE;
use crate::error::{Error, Result};

/// Size of the signed big-endian length word preceding each LDM record.
const CONTROL_WORD_SIZE: usize = 4;

/// Typical NEXRAD bzip2 ratio is 10-12x; pre-allocating 12x keeps
/// reallocation off the hot path for well-formed volumes.
const EXPANSION_FACTOR: usize = 12;

/// Floor for buffer growth so degenerate inputs still make progress.
const MIN_GROW: usize = 4096;

/// Decompress one bzip2 stream, appending to `out` from its current length.
///
/// Output space starts at 12x the input and grows by 1.5x on demand; the
/// buffer is truncated to the exact decompressed size on success and rolled
/// back to its original length on failure. Returns the byte count written.
fn bz2_stream_into(input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
    if input.is_empty() {
        return Err(Error::CorruptContainer("empty bzip2 input".into()));
    }

    let start = out.len();
    let initial = input.len().saturating_mul(EXPANSION_FACTOR).max(MIN_GROW);
    out.resize(start + initial, 0);

    let mut stream = Decompress::new(false);
    loop {
        let in_pos = stream.total_in() as usize;
        let out_pos = start + stream.total_out() as usize;

        if out_pos == out.len() {
            // Grow by half the current output region (1.5x total)
            let grow = ((out.len() - start) / 2).max(MIN_GROW);
            out.resize(out.len() + grow, 0);
        }

        let before_out = stream.total_out();
        match stream.decompress(&input[in_pos..], &mut out[out_pos..]) {
            Ok(Status::StreamEnd) => {
                let written = stream.total_out() as usize;
                out.truncate(start + written);
                return Ok(written);
            }
            Ok(_) => {
                // Input exhausted without reaching stream end means the
                // stream was truncated mid-block.
                if stream.total_in() as usize == input.len()
                    && stream.total_out() == before_out
                {
                    out.truncate(start);
                    return Err(Error::CorruptContainer("truncated bzip2 stream".into()));
                }
            }
            Err(e) => {
                out.truncate(start);
                return Err(Error::CorruptContainer(format!("bzip2: {:?}", e)));
            }
        }
    }
}

/// Walk the LDM record sequence after the volume header.
///
/// Returns the number of records decompressed; zero means the input is not
/// LDM-wrapped and the caller should try the raw-bzip2 fallback.
fn decompress_ldm(data: &[u8], out: &mut Vec<u8>) -> usize {
    out.clear();
    if data.len() < VOLUME_HEADER_SIZE {
        return 0;
    }
    out.reserve(data.len().saturating_mul(EXPANSION_FACTOR) + VOLUME_HEADER_SIZE);
    out.extend_from_slice(&data[..VOLUME_HEADER_SIZE]);

    let mut offset = VOLUME_HEADER_SIZE;
    let mut record_count = 0usize;

    while offset + CONTROL_WORD_SIZE < data.len() {
        let control = i32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        offset += CONTROL_WORD_SIZE;

        // The control word's absolute value gives the compressed block size;
        // a negative word marks the final record of the volume.
        let mut block_size = control.unsigned_abs() as usize;
        if block_size == 0 {
            break;
        }
        if offset + block_size > data.len() {
            block_size = data.len() - offset;
        }

        match bz2_stream_into(&data[offset..offset + block_size], out) {
            Ok(_) => record_count += 1,
            Err(e) => {
                debug!("LDM record {} failed: {}", record_count, e);
                break;
            }
        }
        offset += block_size;
    }

    record_count
}

/// Detect the container shape and produce a contiguous decompressed stream.
///
/// The result starts with the 24-byte volume header when one is present.
/// Inputs that are neither bzip2 nor LDM pass through unchanged, so an
/// already-uncompressed volume decodes the same as a wrapped one.
pub fn auto_decompress(data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();

    if data.is_empty() {
        return Err(Error::CorruptContainer("empty input".into()));
    }

    if data.len() > 2 && data[0] == b'B' && data[1] == b'Z' {
        bz2_stream_into(data, out)?;
        return Ok(());
    }

    if data.len() >= VOLUME_HEADER_SIZE + CONTROL_WORD_SIZE {
        if decompress_ldm(data, out) > 0 {
            return Ok(());
        }
        out.clear();
        if bz2_stream_into(data, out).is_ok() {
            return Ok(());
        }
        out.clear();
    }

    // Already uncompressed, or nothing recognizable: pass through unchanged.
    out.extend_from_slice(data);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::read::BzEncoder;
    use bzip2::Compression;
    use std::io::Read;

    fn bz2(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(data, Compression::best());
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).unwrap();
        compressed
    }

    fn volume_header() -> Vec<u8> {
        let mut header = vec![0u8; VOLUME_HEADER_SIZE];
        header[..8].copy_from_slice(b"AR2V0006");
        header[20..24].copy_from_slice(b"KTLX");
        header
    }

    #[test]
    fn test_raw_bzip2() {
        let payload = b"raw bzip2 payload for a level two volume".repeat(8);
        let compressed = bz2(&payload);
        assert_eq!(&compressed[..2], b"BZ");

        let mut out = Vec::new();
        auto_decompress(&compressed, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_ldm_wrapped_records() {
        let block_a = b"first record payload ".repeat(20);
        let block_b = b"second record payload ".repeat(20);
        let bz_a = bz2(&block_a);
        let bz_b = bz2(&block_b);

        let mut data = volume_header();
        data.extend_from_slice(&(bz_a.len() as i32).to_be_bytes());
        data.extend_from_slice(&bz_a);
        // Negative control word marks the last record
        data.extend_from_slice(&(-(bz_b.len() as i32)).to_be_bytes());
        data.extend_from_slice(&bz_b);

        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();

        assert_eq!(&out[..VOLUME_HEADER_SIZE], &volume_header()[..]);
        let mut expected = block_a.clone();
        expected.extend_from_slice(&block_b);
        assert_eq!(&out[VOLUME_HEADER_SIZE..], &expected[..]);
    }

    #[test]
    fn test_ldm_zero_control_word_terminates() {
        let block = b"only record ".repeat(16);
        let bz = bz2(&block);

        let mut data = volume_header();
        data.extend_from_slice(&(bz.len() as i32).to_be_bytes());
        data.extend_from_slice(&bz);
        data.extend_from_slice(&0i32.to_be_bytes());
        data.extend_from_slice(b"trailing garbage that must be ignored");

        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();
        assert_eq!(&out[VOLUME_HEADER_SIZE..], &block[..]);
    }

    #[test]
    fn test_short_buffer_passes_through() {
        // 16 bytes without the "BZ" magic must come back unchanged
        let data: Vec<u8> = (0u8..16).collect();
        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_uncompressed_volume_passes_through() {
        let mut data = volume_header();
        data.extend_from_slice(&[0xAAu8; 512]);
        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_empty_input_is_corrupt() {
        let mut out = Vec::new();
        assert!(matches!(
            auto_decompress(&[], &mut out),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn test_bz_magic_with_garbage_fails() {
        let mut data = b"BZ".to_vec();
        data.extend_from_slice(&[0x13u8; 64]);
        let mut out = Vec::new();
        assert!(matches!(
            auto_decompress(&data, &mut out),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn test_oversized_control_word_clamped() {
        let block = b"clamped record ".repeat(10);
        let bz = bz2(&block);

        let mut data = volume_header();
        // Control word claims more bytes than remain; walker clamps it
        data.extend_from_slice(&((bz.len() as i32) + 500).to_be_bytes());
        data.extend_from_slice(&bz);

        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();
        assert_eq!(&out[VOLUME_HEADER_SIZE..], &block[..]);
    }
}

//! MSB-first bitmask packing of quantized grids.
//!
//! A grid walks in row-major order; every non-zero cell sets its bit in the
//! mask and appends its value to a parallel stream. Bit 0 of cell 0 is the
//! most-significant bit of byte 0, so masks render left-to-right when dumped.

/// Pack a grid into `(bitmask, values)`, appending to the provided buffers.
///
/// Buffers are cleared first; callers lease them from the buffer pool to
/// keep large transient allocations off the per-volume path.
pub fn pack_into(grid: &[u8], bitmask: &mut Vec<u8>, values: &mut Vec<u8>) {
    bitmask.clear();
    values.clear();
    bitmask.resize((grid.len() + 7) / 8, 0);
    for (i, &cell) in grid.iter().enumerate() {
        if cell > 0 {
            bitmask[i / 8] |= 1 << (7 - (i % 8));
            values.push(cell);
        }
    }
}

/// Pack a grid into freshly allocated buffers.
pub fn pack(grid: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut bitmask = Vec::new();
    let mut values = Vec::new();
    pack_into(grid, &mut bitmask, &mut values);
    (bitmask, values)
}

/// Reconstruct a grid of `cell_count` cells from its packed form.
///
/// Returns `None` when the mask is too short for the grid or the value
/// stream does not match the set-bit count.
pub fn unpack(bitmask: &[u8], values: &[u8], cell_count: usize) -> Option<Vec<u8>> {
    if bitmask.len() < (cell_count + 7) / 8 {
        return None;
    }
    let mut grid = vec![0u8; cell_count];
    let mut next_value = 0usize;
    for (i, cell) in grid.iter_mut().enumerate() {
        if bitmask[i / 8] & (1 << (7 - (i % 8))) != 0 {
            *cell = *values.get(next_value)?;
            next_value += 1;
        }
    }
    if next_value != values.len() {
        return None;
    }
    Some(grid)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_msb_first_bit_order() {
        // Cell 0 set -> MSB of byte 0
        let (bitmask, values) = pack(&[9, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bitmask, vec![0b1000_0000]);
        assert_eq!(values, vec![9]);

        // Cell 7 set -> LSB of byte 0
        let (bitmask, values) = pack(&[0, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(bitmask, vec![0b0000_0001]);
        assert_eq!(values, vec![5]);
    }

    #[test]
    fn test_values_follow_bit_order() {
        let grid = [0u8, 3, 0, 7, 0, 0, 0, 0, 1];
        let (bitmask, values) = pack(&grid);
        assert_eq!(bitmask.len(), 2);
        assert_eq!(bitmask[0], 0b0101_0000);
        assert_eq!(bitmask[1], 0b1000_0000);
        assert_eq!(values, vec![3, 7, 1]);
    }

    #[test]
    fn test_empty_grid() {
        let (bitmask, values) = pack(&[]);
        assert!(bitmask.is_empty());
        assert!(values.is_empty());
        assert_eq!(unpack(&bitmask, &values, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_all_zero_grid() {
        let grid = vec![0u8; 100];
        let (bitmask, values) = pack(&grid);
        assert_eq!(bitmask, vec![0u8; 13]);
        assert!(values.is_empty());
        assert_eq!(unpack(&bitmask, &values, 100).unwrap(), grid);
    }

    #[test]
    fn test_unpack_rejects_short_mask() {
        assert!(unpack(&[0xFF], &[1; 8], 16).is_none());
    }

    #[test]
    fn test_unpack_rejects_value_count_mismatch() {
        let (bitmask, _) = pack(&[1, 2, 3]);
        assert!(unpack(&bitmask, &[1], 3).is_none());
        assert!(unpack(&bitmask, &[1, 2, 3, 4], 3).is_none());
    }

    proptest! {
        /// Treating zero as absent, decode(encode(g)) == g for any grid.
        #[test]
        fn prop_pack_roundtrip(grid in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (bitmask, values) = pack(&grid);
            let recovered = unpack(&bitmask, &values, grid.len()).unwrap();
            prop_assert_eq!(recovered, grid);
        }

        /// The value stream length always equals the set-bit count.
        #[test]
        fn prop_value_count_matches_popcount(grid in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (bitmask, values) = pack(&grid);
            let set_bits: u32 = bitmask.iter().map(|b| b.count_ones()).sum();
            prop_assert_eq!(set_bits as usize, values.len());
        }
    }
}

//! Reassembly of multi-segment messages keyed by sequence number.
//!
//! Large RDA messages (notably the Message 5/18 metadata types) are split
//! across 2432-byte slots; each piece carries the same sequence number with a
//! 1-based segment index. Segments may arrive out of order, including
//! continuations whose openers sit in the Archive II metadata region.

use std::collections::HashMap;

use crate::decode::messages::MessageHeader;
use crate::error::{Error, Result};

/// Upper bound on segments per message; crafted inputs above this are
/// rejected before any allocation happens.
pub const MAX_SEGMENTS: u16 = 2000;

/// A fully reassembled message.
#[derive(Debug)]
pub struct AssembledMessage {
    pub sequence_num: u16,
    pub msg_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct PendingMessage {
    msg_type: u8,
    segments: Vec<Option<Vec<u8>>>,
    received: u16,
    total_bytes: usize,
}

/// Accumulates message segments until each sequence number completes.
#[derive(Debug, Default)]
pub struct MessageSegmenter {
    pending: HashMap<u16, PendingMessage>,
}

impl MessageSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one segment. Returns the completed message once every segment of
    /// its sequence number has arrived; single-segment messages complete
    /// immediately. Duplicate and out-of-range segment numbers are dropped.
    pub fn add_segment(
        &mut self,
        header: &MessageHeader,
        payload: &[u8],
    ) -> Result<Option<AssembledMessage>> {
        if header.num_segments <= 1 {
            return Ok(Some(AssembledMessage {
                sequence_num: header.sequence_num,
                msg_type: header.msg_type,
                data: payload.to_vec(),
            }));
        }

        if header.num_segments > MAX_SEGMENTS {
            return Err(Error::SegmentOverflow(header.num_segments));
        }

        if header.segment_num < 1 || header.segment_num > header.num_segments {
            return Ok(None);
        }

        let entry = self
            .pending
            .entry(header.sequence_num)
            .or_insert_with(|| PendingMessage {
                msg_type: header.msg_type,
                segments: vec![None; header.num_segments as usize],
                received: 0,
                total_bytes: 0,
            });

        // A reused sequence number with a different segment count means the
        // old partial message is stale; start over.
        if entry.segments.len() != header.num_segments as usize {
            *entry = PendingMessage {
                msg_type: header.msg_type,
                segments: vec![None; header.num_segments as usize],
                received: 0,
                total_bytes: 0,
            };
        }

        let slot = &mut entry.segments[header.segment_num as usize - 1];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            entry.received += 1;
            entry.total_bytes += payload.len();
        }

        if entry.received < header.num_segments {
            return Ok(None);
        }
        match self.pending.remove(&header.sequence_num) {
            Some(done) => {
                let mut data = Vec::with_capacity(done.total_bytes);
                for segment in done.segments.into_iter().flatten() {
                    data.extend_from_slice(&segment);
                }
                Ok(Some(AssembledMessage {
                    sequence_num: header.sequence_num,
                    msg_type: done.msg_type,
                    data,
                }))
            }
            None => Ok(None),
        }
    }

    /// Drop all partially assembled messages. Called when a new volume starts
    /// so stale continuations cannot pair with fresh sequence numbers.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of sequence numbers with outstanding segments.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16, num_segments: u16, segment_num: u16) -> MessageHeader {
        MessageHeader {
            size_halfwords: 100,
            rda_channel: 0,
            msg_type: 5,
            sequence_num: seq,
            julian_date: 19000,
            milliseconds: 0,
            num_segments,
            segment_num,
        }
    }

    #[test]
    fn test_single_segment_emits_immediately() {
        let mut segmenter = MessageSegmenter::new();
        let msg = segmenter
            .add_segment(&header(7, 1, 1), b"payload")
            .unwrap()
            .expect("single segment completes");
        assert_eq!(msg.sequence_num, 7);
        assert_eq!(msg.data, b"payload");
        assert_eq!(segmenter.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut segmenter = MessageSegmenter::new();
        assert!(segmenter
            .add_segment(&header(3, 3, 2), b"BBB")
            .unwrap()
            .is_none());
        assert!(segmenter
            .add_segment(&header(3, 3, 3), b"CC")
            .unwrap()
            .is_none());
        let msg = segmenter
            .add_segment(&header(3, 3, 1), b"A")
            .unwrap()
            .expect("final segment completes");
        assert_eq!(msg.data, b"ABBBCC");
        assert_eq!(segmenter.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_segments_dropped() {
        let mut segmenter = MessageSegmenter::new();
        assert!(segmenter
            .add_segment(&header(9, 2, 1), b"first")
            .unwrap()
            .is_none());
        assert!(segmenter
            .add_segment(&header(9, 2, 1), b"DUPLICATE")
            .unwrap()
            .is_none());
        let msg = segmenter
            .add_segment(&header(9, 2, 2), b"-second")
            .unwrap()
            .unwrap();
        assert_eq!(msg.data, b"first-second");
    }

    #[test]
    fn test_segment_overflow_guard() {
        let mut segmenter = MessageSegmenter::new();
        let result = segmenter.add_segment(&header(1, 2001, 1), b"x");
        assert!(matches!(result, Err(Error::SegmentOverflow(2001))));
        assert_eq!(segmenter.pending_count(), 0);
    }

    #[test]
    fn test_out_of_range_segment_ignored() {
        let mut segmenter = MessageSegmenter::new();
        assert!(segmenter
            .add_segment(&header(4, 2, 0), b"x")
            .unwrap()
            .is_none());
        assert!(segmenter
            .add_segment(&header(4, 2, 3), b"x")
            .unwrap()
            .is_none());
        assert_eq!(segmenter.pending_count(), 0);
    }

    #[test]
    fn test_clear_discards_pending() {
        let mut segmenter = MessageSegmenter::new();
        segmenter.add_segment(&header(5, 4, 1), b"x").unwrap();
        assert_eq!(segmenter.pending_count(), 1);
        segmenter.clear();
        assert_eq!(segmenter.pending_count(), 0);
    }
}

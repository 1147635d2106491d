//! Error types for the Level II ingestion service

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding, transcoding, or ingesting
/// NEXRAD Level II volumes.
#[derive(Error, Debug)]
pub enum Error {
    /// Input shorter than a required struct or payload
    #[error("truncated input: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Message header failed its validity predicate
    #[error("invalid message header: {0}")]
    InvalidHeader(String),

    /// Neither the LDM walk, raw bzip2, nor pass-through succeeded
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// Segment count exceeds the reassembly guard
    #[error("segment count {0} exceeds reassembly limit")]
    SegmentOverflow(u16),

    /// Data block pointer null, beyond the payload, or overflowing
    #[error("data block pointer out of range: offset {offset} in payload of {payload_len}")]
    PointerOutOfRange { offset: usize, payload_len: usize },

    /// Moment block with an unusable word size or gate count
    #[error("unsupported moment encoding: {0}")]
    UnsupportedMoment(String),

    /// No valid radials were decoded for any requested product
    #[error("no radials decoded for any requested product")]
    EmptyFrame,

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object-store listing or fetch failed
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Malformed persisted config or posted body
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// Decoder-local errors are recovered in place: the offending radial or
    /// block is skipped and scanning resumes.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::InvalidHeader(_)
                | Error::SegmentOverflow(_)
                | Error::PointerOutOfRange { .. }
                | Error::UnsupportedMoment(_)
        )
    }
}

//! Library-boundary error taxonomy: orthogonal failure flags on a common
//! carrier, typed with `thiserror` while the CLI boundary stays on
//! `anyhow`.

use thiserror::Error;

/// Errors raised by the segments/packing engine.
#[derive(Debug, Error)]
pub enum XspError {
    /// Header decode failure: bad length or an unrecognized format version.
    #[error("header parsing failed: {0}")]
    InputParsing(String),

    /// A position or length falls outside the current geometry.
    #[error("position/length out of bounds: {0}")]
    ArgsOutOfBounds(String),

    /// A segment id doesn't exist in the writer/reader's geometry.
    #[error("unknown segment: {0}")]
    UnknownSeg(String),

    /// Attempt to mutate or repack a region whose new bytes are already sealed.
    #[error("segment already packed: {0}")]
    SegsPacked(String),

    /// Geometry-changing call after the header was sealed.
    #[error("header already packed, geometry is frozen")]
    HeaderPacked,

    /// `segment_infos` iterator observed a geometry rebuild mid-iteration.
    #[error("geometry changed during iteration")]
    ConcurrentIteration,

    /// Reader header validation: version didn't match the expected delta.
    #[error("version mismatch: expected delta {expected}, header implies {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// Reader header validation: the header's nonce lanes don't agree on a
    /// common delta at all.
    #[error("nonce lanes disagree, header does not belong to this chain of versions")]
    NonceMismatch,

    /// The cryptor failed to authenticate a ciphertext (wrong key, corrupt
    /// data, or a segment/header that was tampered with).
    #[error("authentication failed: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, XspError>;

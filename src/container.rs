//! Container byte framing: the file magic plus the header offset that
//! sits in front of the segments/header this crate actually produces and
//! consumes. Documented as the surrounding on-disk shape, not a full
//! component in its own right.
//!
//! This module only encodes/decodes the fixed framing bytes. It performs
//! no file I/O, persistence, or transport.

use crate::error::{Result, XspError};

/// Largest representable header offset: `2^48 - 1`.
pub const MAX_OFFSET: u64 = (1u64 << 48) - 1;

const MAGIC_LEN: usize = 3;
const OFFSET_LEN: usize = 8;
pub const PREFIX_LEN: usize = MAGIC_LEN + OFFSET_LEN;

/// Which of the three magics a container uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `xsp`: segments then header, both in one file.
    Full,
    /// `hxsp`: header only.
    HeaderOnly,
    /// `sxsp`: segments only.
    SegmentsOnly,
}

impl ContainerKind {
    fn magic(self) -> &'static [u8] {
        match self {
            ContainerKind::Full => b"xsp",
            ContainerKind::HeaderOnly => b"hxsp",
            ContainerKind::SegmentsOnly => b"sxsp",
        }
    }
}

/// Encodes the 11-byte prefix of a full (`xsp`) container: 3-byte magic
/// followed by an 8-byte big-endian header offset.
pub fn encode_full_prefix(header_ofs: u64) -> Result<[u8; PREFIX_LEN]> {
    if header_ofs > MAX_OFFSET {
        return Err(XspError::ArgsOutOfBounds(format!(
            "header offset {header_ofs} exceeds the max representable offset {MAX_OFFSET}"
        )));
    }
    let mut out = [0u8; PREFIX_LEN];
    out[..MAGIC_LEN].copy_from_slice(ContainerKind::Full.magic());
    out[MAGIC_LEN..].copy_from_slice(&header_ofs.to_be_bytes());
    Ok(out)
}

/// Decodes the 11-byte prefix of a full (`xsp`) container, returning the
/// header offset.
pub fn decode_full_prefix(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < PREFIX_LEN {
        return Err(XspError::InputParsing(
            "container prefix shorter than 11 bytes".into(),
        ));
    }
    if &bytes[..MAGIC_LEN] != ContainerKind::Full.magic() {
        return Err(XspError::InputParsing(
            "bad magic for a full xsp container".into(),
        ));
    }
    let ofs = u64::from_be_bytes(bytes[MAGIC_LEN..PREFIX_LEN].try_into().unwrap());
    if ofs > MAX_OFFSET {
        return Err(XspError::InputParsing(format!(
            "header offset {ofs} exceeds the max representable offset {MAX_OFFSET}"
        )));
    }
    Ok(ofs)
}

/// Recognizes a header-only (`hxsp`) or segments-only (`sxsp`) container by
/// its magic alone; these carry no offset field.
pub fn sniff_bare_magic(bytes: &[u8]) -> Option<ContainerKind> {
    if bytes.starts_with(ContainerKind::HeaderOnly.magic()) {
        Some(ContainerKind::HeaderOnly)
    } else if bytes.starts_with(ContainerKind::SegmentsOnly.magic()) {
        Some(ContainerKind::SegmentsOnly)
    } else {
        None
    }
}

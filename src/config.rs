//! Construction-time configuration for a new or resumed XSP object:
//! invalid combinations fail at `SegConfig::new`, not deep inside the
//! packing engine.

use crate::error::{Result, XspError};
use crate::nonce::Nonce;

/// Settings a caller fixes once, at the start of a version: the segment
/// size, the payload's declared format, and the header's zeroth nonce
/// lane.
#[derive(Debug, Clone, Copy)]
pub struct SegConfig {
    pub seg_size_in_256b: u16,
    pub payload_format: u32,
    pub zeroth_header_nonce: Nonce,
}

impl SegConfig {
    pub fn new(seg_size_in_256b: u16, payload_format: u32, zeroth_header_nonce: Nonce) -> Result<Self> {
        if seg_size_in_256b == 0 {
            return Err(XspError::ArgsOutOfBounds(
                "segSize/256 must be >= 1".into(),
            ));
        }
        Ok(Self {
            seg_size_in_256b,
            payload_format,
            zeroth_header_nonce,
        })
    }

    pub fn seg_size(&self) -> u32 {
        (self.seg_size_in_256b as u32) << 8
    }
}

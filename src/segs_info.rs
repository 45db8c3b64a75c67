//! In-memory segment-chain data model (spec §3: "SegsInfo").

use crate::nonce::Nonce;

/// Sentinel `numOfSegs` marking a chain as endless (spec §3).
pub const MAX_SEG_INDEX: u32 = 0xFFFF_FFFF;

/// The geometry of one segment chain: either a fixed number of segments, or
/// a trailing chain whose length is not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainGeometry {
    Finite { num_of_segs: u32, last_seg_size: u32 },
    Endless,
}

impl ChainGeometry {
    pub fn is_endless(&self) -> bool {
        matches!(self, ChainGeometry::Endless)
    }
}

/// One segment chain: a contiguous run of segments sharing a first-nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegChainInfo {
    pub first_nonce: Nonce,
    pub geometry: ChainGeometry,
}

impl SegChainInfo {
    pub fn finite(first_nonce: Nonce, num_of_segs: u32, last_seg_size: u32) -> Self {
        assert!(num_of_segs >= 1, "a finite chain must have at least one segment");
        Self {
            first_nonce,
            geometry: ChainGeometry::Finite {
                num_of_segs,
                last_seg_size,
            },
        }
    }

    pub fn endless(first_nonce: Nonce) -> Self {
        Self {
            first_nonce,
            geometry: ChainGeometry::Endless,
        }
    }

    pub fn is_endless(&self) -> bool {
        self.geometry.is_endless()
    }

    /// Number of segments, if finite.
    pub fn num_of_segs(&self) -> Option<u32> {
        match self.geometry {
            ChainGeometry::Finite { num_of_segs, .. } => Some(num_of_segs),
            ChainGeometry::Endless => None,
        }
    }

    pub fn last_seg_size(&self, seg_size: u32) -> u32 {
        match self.geometry {
            ChainGeometry::Finite { last_seg_size, .. } => last_seg_size,
            ChainGeometry::Endless => seg_size,
        }
    }

    /// Plaintext content length of a finite chain.
    pub fn content_len(&self, seg_size: u32) -> Option<u64> {
        match self.geometry {
            ChainGeometry::Finite {
                num_of_segs,
                last_seg_size,
            } => Some((num_of_segs as u64 - 1) * seg_size as u64 + last_seg_size as u64),
            ChainGeometry::Endless => None,
        }
    }

    pub fn max_seg_index(&self) -> u32 {
        match self.geometry {
            ChainGeometry::Finite { num_of_segs, .. } => num_of_segs - 1,
            ChainGeometry::Endless => MAX_SEG_INDEX,
        }
    }
}

/// The full in-memory description of an object's segment geometry: common
/// segment size, format versions, and the ordered chain list. At most the
/// last chain may be endless.
#[derive(Debug, Clone)]
pub struct SegsInfo {
    pub seg_size: u32,
    pub format_version: u8,
    pub payload_format_version: u32,
    pub seg_chains: Vec<SegChainInfo>,
}

impl SegsInfo {
    pub fn new(seg_size: u32, format_version: u8, payload_format_version: u32) -> Self {
        Self {
            seg_size,
            format_version,
            payload_format_version,
            seg_chains: Vec::new(),
        }
    }

    pub fn has_endless_tail(&self) -> bool {
        self.seg_chains.last().map(|c| c.is_endless()).unwrap_or(false)
    }
}

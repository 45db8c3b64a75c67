//! The `Locations` index: a recomputable mapping from `(chain, segment)`
//! to content/packed byte offsets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, XspError};
use crate::nonce::calculate_nonce;
use crate::segs_info::{SegChainInfo, SegsInfo};
use crate::POLY;

/// A segment's coordinates in both the content (plaintext) and packed
/// (ciphertext) address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub chain: usize,
    pub seg: u32,
    pub content_ofs: u64,
    pub content_len: u64,
    pub packed_ofs: u64,
    pub packed_len: u64,
    pub endless_chain: bool,
}

#[derive(Debug, Clone, Copy)]
struct ChainEntry {
    content_start: u64,
    content_end: Option<u64>,
    packed_start: u64,
    packed_end: Option<u64>,
}

/// The geometry index over a `SegsInfo`'s chain list. Immutable once built;
/// owners rebuild it (and bump a shared variant counter) after every
/// geometry mutation.
#[derive(Debug, Clone)]
pub struct Locations {
    seg_size: u32,
    chains: Vec<ChainEntry>,
    variant: u64,
}

impl Locations {
    /// Scans `info.seg_chains` and fills running offsets. `variant` should
    /// be a freshly-incremented value from the owner's shared counter so
    /// live iterators over the previous `Locations` observe the change.
    pub fn build(info: &SegsInfo, variant: u64) -> Self {
        let seg_size = info.seg_size as u64;
        let mut chains = Vec::with_capacity(info.seg_chains.len());
        let mut content_cursor = 0u64;
        let mut packed_cursor = 0u64;

        for chain in &info.seg_chains {
            let content_start = content_cursor;
            let packed_start = packed_cursor;
            match chain.num_of_segs() {
                Some(n) => {
                    let last_seg_size = chain.last_seg_size(info.seg_size) as u64;
                    let content_len = (n as u64 - 1) * seg_size + last_seg_size;
                    let packed_len = content_len + n as u64 * POLY as u64;
                    content_cursor += content_len;
                    packed_cursor += packed_len;
                    chains.push(ChainEntry {
                        content_start,
                        content_end: Some(content_cursor),
                        packed_start,
                        packed_end: Some(packed_cursor),
                    });
                }
                None => {
                    chains.push(ChainEntry {
                        content_start,
                        content_end: None,
                        packed_start,
                        packed_end: None,
                    });
                }
            }
        }

        Self {
            seg_size: info.seg_size,
            chains,
            variant,
        }
    }

    pub fn variant(&self) -> u64 {
        self.variant
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Total finite content length, if the geometry is not endless.
    pub fn content_length(&self) -> Option<u64> {
        self.chains.last().and_then(|c| c.content_end)
    }

    /// Total finite packed length, if the geometry is not endless.
    pub fn segments_length(&self) -> Option<u64> {
        self.chains.last().and_then(|c| c.packed_end)
    }

    pub fn is_endless(&self) -> bool {
        self.chains.last().map(|c| c.content_end.is_none()).unwrap_or(false)
    }

    /// Locates the chain/segment/offset-within-segment that contains
    /// content offset `p`.
    pub fn locate_content_ofs(&self, p: u64) -> Result<(usize, u32, u64)> {
        for (idx, chain) in self.chains.iter().enumerate() {
            if chain.content_end.is_none() || chain.content_end.unwrap() > p {
                let seg_size = self.seg_size as u64;
                let seg = ((p - chain.content_start) / seg_size) as u32;
                let pos_in_seg = (p - chain.content_start) % seg_size;
                return Ok((idx, seg, pos_in_seg));
            }
        }
        Err(XspError::ArgsOutOfBounds(format!(
            "content offset {p} is beyond the end of the geometry"
        )))
    }

    /// Locates the chain/segment/offset-within-segment that contains packed
    /// (ciphertext-stream) offset `p`.
    pub fn locate_segs_ofs(&self, p: u64) -> Result<(usize, u32, u64)> {
        let stride = self.seg_size as u64 + POLY as u64;
        for (idx, chain) in self.chains.iter().enumerate() {
            if chain.packed_end.is_none() || chain.packed_end.unwrap() > p {
                let seg = ((p - chain.packed_start) / stride) as u32;
                let pos_in_seg = (p - chain.packed_start) % stride;
                return Ok((idx, seg, pos_in_seg));
            }
        }
        Err(XspError::ArgsOutOfBounds(format!(
            "packed offset {p} is beyond the end of the geometry"
        )))
    }

    /// Returns the full coordinates of one segment.
    pub fn segment_info(&self, info: &SegsInfo, chain_idx: usize, seg: u32) -> Result<SegmentInfo> {
        let chain = info.seg_chains.get(chain_idx).ok_or_else(|| {
            XspError::UnknownSeg(format!("chain {chain_idx} does not exist"))
        })?;
        let entry = self.chains.get(chain_idx).expect("chains/index length mismatch");

        match chain.num_of_segs() {
            Some(n) => {
                if seg >= n {
                    return Err(XspError::UnknownSeg(format!(
                        "segment {seg} out of range for chain {chain_idx} with {n} segments"
                    )));
                }
                let is_last = seg == n - 1;
                let content_len = if is_last {
                    chain.last_seg_size(info.seg_size) as u64
                } else {
                    info.seg_size as u64
                };
                let content_ofs = entry.content_start + seg as u64 * info.seg_size as u64;
                let packed_ofs = entry.packed_start + seg as u64 * (info.seg_size as u64 + POLY as u64);
                Ok(SegmentInfo {
                    chain: chain_idx,
                    seg,
                    content_ofs,
                    content_len,
                    packed_ofs,
                    packed_len: content_len + POLY as u64,
                    endless_chain: false,
                })
            }
            None => {
                let content_ofs = entry.content_start + seg as u64 * info.seg_size as u64;
                let packed_ofs = entry.packed_start + seg as u64 * (info.seg_size as u64 + POLY as u64);
                Ok(SegmentInfo {
                    chain: chain_idx,
                    seg,
                    content_ofs,
                    content_len: info.seg_size as u64,
                    packed_ofs,
                    packed_len: info.seg_size as u64 + POLY as u64,
                    endless_chain: true,
                })
            }
        }
    }

    /// `calculateNonce(chain.firstNonce, seg)`; errors with `UnknownSeg` if
    /// `seg` is out of range for a finite chain.
    pub fn segment_nonce(&self, chain: &SegChainInfo, chain_idx: usize, seg: u32) -> Result<crate::nonce::Nonce> {
        if let Some(n) = chain.num_of_segs() {
            if seg >= n {
                return Err(XspError::UnknownSeg(format!(
                    "segment {seg} out of range for chain {chain_idx} with {n} segments"
                )));
            }
        }
        Ok(calculate_nonce(&chain.first_nonce, seg as u64))
    }

    /// Lazily iterates every segment from `from` (chain, seg) onward,
    /// failing fast with `ConcurrentIteration` if `variant_counter`'s value
    /// diverges from the value captured at `Locations::build` time.
    pub fn segment_infos<'a>(
        &'a self,
        info: &'a SegsInfo,
        from: Option<(usize, u32)>,
        variant_counter: Arc<AtomicU64>,
    ) -> SegmentInfosIter<'a> {
        let (chain, seg) = from.unwrap_or((0, 0));
        SegmentInfosIter {
            locations: self,
            info,
            expected_variant: self.variant,
            variant_counter,
            chain,
            seg,
            done: false,
        }
    }
}

/// Iterator returned by [`Locations::segment_infos`].
pub struct SegmentInfosIter<'a> {
    locations: &'a Locations,
    info: &'a SegsInfo,
    expected_variant: u64,
    variant_counter: Arc<AtomicU64>,
    chain: usize,
    seg: u32,
    done: bool,
}

impl<'a> Iterator for SegmentInfosIter<'a> {
    type Item = Result<SegmentInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.variant_counter.load(Ordering::SeqCst) != self.expected_variant {
            self.done = true;
            return Some(Err(XspError::ConcurrentIteration));
        }

        loop {
            if self.chain >= self.locations.chains.len() {
                self.done = true;
                return None;
            }
            let chain_info = &self.info.seg_chains[self.chain];
            match chain_info.num_of_segs() {
                Some(n) if self.seg >= n => {
                    self.chain += 1;
                    self.seg = 0;
                    continue;
                }
                _ => break,
            }
        }

        let result = self.locations.segment_info(self.info, self.chain, self.seg);
        self.seg += 1;
        Some(result)
    }
}

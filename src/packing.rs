//! `PackingInfo` (spec §4.6): the splice/cut/grow state machine that turns a
//! requested content-length change into a new chain list, tracking which
//! segments of which chains still need (re-)encryption.
//!
//! Two chain flavors coexist in a writer's geometry:
//!
//! - **Base** chains reference ciphertext already on disk from a previous
//!   version. Nothing in them needs packing unless a splice lands inside one,
//!   in which case the touched edge segment is carved off into a one-segment
//!   **New** chain carrying `headBytes` (borrowed plaintext re-encrypted
//!   under a fresh nonce).
//! - **New** chains hold content that has never been packed, or only
//!   partially packed; `NewSegments` tracks which of their segment indices
//!   are still outstanding.
//!
//! Splicing never mutates a chain's bytes once packed; it only ever drops,
//! truncates at an edge, or appends chains. `Locations` is rebuilt wholesale
//! after every structural change, and the shared variant counter is bumped
//! so live iterators see `ConcurrentIteration` (spec §4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cryptor::SegRng;
use crate::error::{Result, XspError};
use crate::locations::Locations;
use crate::nonce::{calculate_nonce, Nonce};
use crate::segs_info::{SegChainInfo, SegsInfo, MAX_SEG_INDEX};
use crate::POLY;

/// Plaintext borrowed from one segment of a base chain and re-encrypted
/// under a fresh nonce as the sole content of a one-segment new chain. Used
/// at splice edges that don't land on a segment boundary (spec §4.6,
/// `cutEdgeSegmentOf`).
#[derive(Debug, Clone, Copy)]
pub struct HeadBytes {
    /// Borrowed plaintext length; always `<= seg_size`.
    pub len: u32,
    /// Offset of the source segment in the *base version's* packed stream.
    pub base_packed_ofs: u64,
    /// Offset, in the *base version's content stream*, of the first
    /// borrowed byte. Lets a content-space layout point back at the exact
    /// base byte range this chain re-encrypts.
    pub base_content_ofs: u64,
    /// Plaintext length of the source segment (matters when it was itself
    /// the base chain's last, short segment).
    pub base_plain_len: u32,
    /// Nonce to open the source segment under the base version's key.
    pub base_nonce: Nonce,
}

/// Disjoint, sorted, inclusive `[lo, hi]` ranges of segment indices that a
/// new chain has not yet packed. Starts covering the whole chain; shrinks as
/// `packSeg` calls mark segments done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegments {
    ranges: Vec<(u32, u32)>,
}

impl NewSegments {
    pub fn all_unpacked(max_seg: u32) -> Self {
        Self {
            ranges: vec![(0, max_seg)],
        }
    }

    pub fn none_unpacked() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn is_fully_unpacked(&self, max_seg: u32) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == (0, max_seg)
    }

    pub fn has_any_packed(&self, max_seg: u32) -> bool {
        !self.is_fully_unpacked(max_seg)
    }

    pub fn needs_packing(&self, seg: u32) -> bool {
        self.ranges.iter().any(|&(a, b)| seg >= a && seg <= b)
    }

    pub fn mark_packed(&mut self, seg: u32) -> Result<()> {
        for i in 0..self.ranges.len() {
            let (a, b) = self.ranges[i];
            if seg < a || seg > b {
                continue;
            }
            self.ranges.remove(i);
            let mut insert_at = i;
            if seg > a {
                self.ranges.insert(insert_at, (a, seg - 1));
                insert_at += 1;
            }
            if seg < b {
                self.ranges.insert(insert_at, (seg + 1, b));
            }
            return Ok(());
        }
        Err(XspError::SegsPacked(format!(
            "segment {seg} is already packed"
        )))
    }

    /// True iff every index in `[lo, hi]` is unpacked (the range may span
    /// multiple `ranges` entries, as long as there's no gap).
    pub fn covers_fully(&self, lo: u32, hi: u32) -> bool {
        if lo > hi {
            return true;
        }
        let mut cursor = lo;
        for &(a, b) in &self.ranges {
            if a > cursor {
                break;
            }
            if b >= cursor {
                cursor = b.saturating_add(1);
                if cursor > hi {
                    return true;
                }
            }
        }
        false
    }

    pub fn can_grow_tail(&self, old_max: u32) -> bool {
        self.ranges.last().map(|&(_, b)| b == old_max).unwrap_or(false)
    }

    pub fn grow_tail(&mut self, old_max: u32, new_max: u32) {
        if let Some(last) = self.ranges.last_mut() {
            if last.1 == old_max {
                last.1 = new_max;
                return;
            }
        }
        self.ranges.push((old_max + 1, new_max));
    }

    /// Restricts the tracked ranges to `[0, new_max]`, dropping/trimming
    /// anything beyond it. Caller is responsible for checking
    /// `covers_fully(new_max + 1, old_max)` first.
    pub fn cut_tail(&mut self, new_max: u32) {
        self.ranges.retain(|&(a, _)| a <= new_max);
        for r in self.ranges.iter_mut() {
            if r.1 > new_max {
                r.1 = new_max;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChainKind {
    Base {
        base_ofs: u64,
        base_content_ofs: u64,
    },
    New {
        unpacked: NewSegments,
        head_bytes: Option<HeadBytes>,
    },
}

impl ChainKind {
    pub fn is_base(&self) -> bool {
        matches!(self, ChainKind::Base { .. })
    }

    pub fn as_new(&self) -> Option<&NewSegments> {
        match self {
            ChainKind::New { unpacked, .. } => Some(unpacked),
            ChainKind::Base { .. } => None,
        }
    }

    pub fn as_new_mut(&mut self) -> Option<&mut NewSegments> {
        match self {
            ChainKind::New { unpacked, .. } => Some(unpacked),
            ChainKind::Base { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chain {
    pub geom: SegChainInfo,
    pub kind: ChainKind,
}

impl Chain {
    fn new_finite(first_nonce: Nonce, num_of_segs: u32, last_seg_size: u32) -> Self {
        Self {
            geom: SegChainInfo::finite(first_nonce, num_of_segs, last_seg_size),
            kind: ChainKind::New {
                unpacked: NewSegments::all_unpacked(num_of_segs - 1),
                head_bytes: None,
            },
        }
    }

    fn new_endless(first_nonce: Nonce) -> Self {
        Self {
            geom: SegChainInfo::endless(first_nonce),
            kind: ChainKind::New {
                unpacked: NewSegments::all_unpacked(MAX_SEG_INDEX),
                head_bytes: None,
            },
        }
    }

    fn seg_plain_len(&self, seg_size: u32, seg: u32) -> u32 {
        match self.geom.num_of_segs() {
            Some(n) if seg == n - 1 => self.geom.last_seg_size(seg_size),
            _ => seg_size,
        }
    }
}

fn geometry_for(seg_size: u32, content_len: u64) -> (u32, u32) {
    if content_len == 0 {
        return (0, 0);
    }
    let seg_size64 = seg_size as u64;
    let num_of_segs = ((content_len - 1) / seg_size64 + 1) as u32;
    let last_seg_size = (content_len - (num_of_segs as u64 - 1) * seg_size64) as u32;
    (num_of_segs, last_seg_size)
}

/// The full splice/cut/grow state machine over a writer's chain list.
pub struct PackingInfo {
    seg_size: u32,
    format_version: u8,
    payload_format_version: u32,
    chains: Vec<Chain>,
    header_packed: bool,
    /// Set by `from_restart`: the chain list is geometry-fixed the moment
    /// it's built (a restart re-encrypts exactly what was there before),
    /// so `splice`/`grow`/`cut` are rejected even though the header hasn't
    /// been packed yet this session.
    restart_frozen: bool,
    variant_counter: Arc<AtomicU64>,
    locations: Locations,
    rng: Arc<dyn SegRng>,
}

impl PackingInfo {
    /// Fresh object, no base version (writer's `new` constructor).
    pub fn new(seg_size: u32, format_version: u8, payload_format_version: u32, rng: Arc<dyn SegRng>) -> Self {
        let info = SegsInfo::new(seg_size, format_version, payload_format_version);
        let locations = Locations::build(&info, 0);
        Self {
            seg_size,
            format_version,
            payload_format_version,
            chains: Vec::new(),
            header_packed: false,
            restart_frozen: false,
            variant_counter: Arc::new(AtomicU64::new(0)),
            locations,
            rng,
        }
    }

    /// Resume writing the same version after a restart; every chain in
    /// `header` is reinterpreted as a new chain fully unpacked (writer's
    /// `restart` constructor — nothing on disk from the still-open write is
    /// trusted as already-sealed). The geometry is fixed the instant this
    /// is built: a restart re-encrypts exactly the chain list it was given,
    /// it does not renegotiate it.
    pub fn from_restart(header: &SegsInfo, rng: Arc<dyn SegRng>) -> Self {
        let chains = header
            .seg_chains
            .iter()
            .map(|c| Chain {
                geom: *c,
                kind: ChainKind::New {
                    unpacked: NewSegments::all_unpacked(c.max_seg_index()),
                    head_bytes: None,
                },
            })
            .collect::<Vec<_>>();
        let mut pi = Self::from_chains(header, chains, rng);
        pi.restart_frozen = true;
        pi
    }

    /// Start a new version against a previously sealed `header` (writer's
    /// `update` constructor); every chain starts out as a base reference.
    pub fn from_base(header: &SegsInfo, rng: Arc<dyn SegRng>) -> Self {
        let mut base_ofs = 0u64;
        let mut base_content_ofs = 0u64;
        let chains = header
            .seg_chains
            .iter()
            .map(|c| {
                let chain = Chain {
                    geom: *c,
                    kind: ChainKind::Base {
                        base_ofs,
                        base_content_ofs,
                    },
                };
                if let Some(packed_len) = c.content_len(header.seg_size).map(|cl| {
                    cl + c.num_of_segs().unwrap_or(0) as u64 * POLY as u64
                }) {
                    base_ofs += packed_len;
                    base_content_ofs += c.content_len(header.seg_size).unwrap_or(0);
                }
                chain
            })
            .collect::<Vec<_>>();
        Self::from_chains(header, chains, rng)
    }

    fn from_chains(header: &SegsInfo, chains: Vec<Chain>, rng: Arc<dyn SegRng>) -> Self {
        let mut pi = Self {
            seg_size: header.seg_size,
            format_version: header.format_version,
            payload_format_version: header.payload_format_version,
            chains,
            header_packed: false,
            restart_frozen: false,
            variant_counter: Arc::new(AtomicU64::new(0)),
            locations: Locations::build(&SegsInfo::new(header.seg_size, header.format_version, header.payload_format_version), 0),
            rng,
        };
        pi.rebuild_locations();
        pi
    }

    fn ensure_not_frozen(&self) -> Result<()> {
        if self.header_packed || self.restart_frozen {
            return Err(XspError::HeaderPacked);
        }
        Ok(())
    }

    pub fn mark_header_packed(&mut self) {
        self.header_packed = true;
    }

    pub fn header_packed(&self) -> bool {
        self.header_packed
    }

    pub fn variant_counter(&self) -> Arc<AtomicU64> {
        self.variant_counter.clone()
    }

    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn seg_size(&self) -> u32 {
        self.seg_size
    }

    /// A snapshot of the current geometry as a plain `SegsInfo`, the same
    /// shape the header codec and `Locations` work with.
    pub fn segs_info(&self) -> SegsInfo {
        let mut info = SegsInfo::new(self.seg_size, self.format_version, self.payload_format_version);
        info.seg_chains = self.chains.iter().map(|c| c.geom).collect();
        info
    }

    /// Look up one chain's current kind/geometry by index.
    pub fn chain(&self, idx: usize) -> Option<&Chain> {
        self.chains.get(idx)
    }

    fn rebuild_locations(&mut self) {
        let variant = self.variant_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.locations = Locations::build(&self.segs_info(), variant);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.locations.content_length()
    }

    pub fn is_endless(&self) -> bool {
        self.locations.is_endless()
    }

    pub fn mark_seg_packed(&mut self, chain_idx: usize, seg: u32) -> Result<()> {
        let chain = self
            .chains
            .get_mut(chain_idx)
            .ok_or_else(|| XspError::UnknownSeg(format!("chain {chain_idx} does not exist")))?;
        match &mut chain.kind {
            ChainKind::New { unpacked, .. } => unpacked.mark_packed(seg),
            ChainKind::Base { .. } => Ok(()),
        }
    }

    /// spec §4.6 `turnIntoEndlessChain`: only ever applies to the last chain,
    /// and only when it can still grow its tail (i.e. is not itself already
    /// capped by a packed segment at its current top).
    pub fn turn_into_endless_chain(&mut self) -> Result<()> {
        self.ensure_not_frozen()?;
        let idx = self.chains.len().checked_sub(1).ok_or_else(|| {
            XspError::ArgsOutOfBounds("no chain to turn endless".into())
        })?;
        let old_max = self.chains[idx].geom.max_seg_index();
        let chain = &mut self.chains[idx];
        match &mut chain.kind {
            ChainKind::New { unpacked, .. } => {
                if !unpacked.can_grow_tail(old_max) {
                    return Err(XspError::SegsPacked(
                        "cannot turn a chain endless past an already-packed tail segment".into(),
                    ));
                }
                unpacked.grow_tail(old_max, MAX_SEG_INDEX);
                chain.geom = SegChainInfo::endless(chain.geom.first_nonce);
                Ok(())
            }
            ChainKind::Base { .. } => Err(XspError::ArgsOutOfBounds(
                "base chains are always finite".into(),
            )),
        }
    }

    /// spec §4.6 `turnEndlessToFinite`, the `update`-constructor path: the
    /// base's endless tail is capped once we learn how many bytes of it were
    /// actually packed in the prior version.
    pub fn turn_endless_to_finite_from_packed_len(&mut self, chain_idx: usize, packed_len: u64) -> Result<()> {
        let stride = (self.seg_size as u64) + POLY as u64;
        let num_of_segs = (packed_len / stride) as u32;
        let remainder = packed_len % stride;
        let (num_of_segs, last_seg_size) = if remainder == 0 {
            (num_of_segs, self.seg_size)
        } else {
            (num_of_segs + 1, (remainder - POLY as u64) as u32)
        };
        let chain = self
            .chains
            .get_mut(chain_idx)
            .ok_or_else(|| XspError::UnknownSeg(format!("chain {chain_idx} does not exist")))?;
        chain.geom = SegChainInfo::finite(chain.geom.first_nonce, num_of_segs.max(1), last_seg_size);
        Ok(())
    }

    /// spec §4.6 `turnEndlessToFinite`, the `packSeg`-discovers-EOF path: the
    /// caller packed `seg` with fewer than `seg_size` plaintext bytes on an
    /// endless chain, which finalizes that chain's length right there.
    pub fn turn_endless_to_finite_at_seg(&mut self, chain_idx: usize, seg: u32, content_len: u64) -> Result<()> {
        let chain = self
            .chains
            .get_mut(chain_idx)
            .ok_or_else(|| XspError::UnknownSeg(format!("chain {chain_idx} does not exist")))?;
        chain.geom = SegChainInfo::finite(chain.geom.first_nonce, seg + 1, content_len as u32);
        if let ChainKind::New { unpacked, .. } = &mut chain.kind {
            unpacked.cut_tail(seg);
        }
        self.rebuild_locations();
        Ok(())
    }

    fn add_new_finite_chain(&mut self, content_len: u64) {
        let (n, last) = geometry_for(self.seg_size, content_len);
        if n == 0 {
            return;
        }
        let nonce = self.rng.nonce();
        self.chains.push(Chain::new_finite(nonce, n, last));
    }

    fn add_new_endless_chain(&mut self) {
        let nonce = self.rng.nonce();
        self.chains.push(Chain::new_endless(nonce));
    }

    /// spec §4.6 `growFileBy`: extend an existing growable tail chain, or
    /// append a fresh one.
    pub fn grow_file_by(&mut self, delta: u64) -> Result<()> {
        self.ensure_not_frozen()?;
        if delta == 0 {
            return Ok(());
        }
        if self.is_endless() {
            return Err(XspError::ArgsOutOfBounds(
                "cannot grow an endless file by a fixed amount".into(),
            ));
        }
        if let Some(last) = self.chains.last() {
            let old_max = last.geom.max_seg_index();
            if let ChainKind::New { unpacked, .. } = &last.kind {
                if unpacked.can_grow_tail(old_max) {
                    let old_content_len = last.geom.content_len(self.seg_size).unwrap();
                    let new_content_len = old_content_len + delta;
                    let (new_n, new_last) = geometry_for(self.seg_size, new_content_len);
                    let idx = self.chains.len() - 1;
                    let first_nonce = self.chains[idx].geom.first_nonce;
                    self.chains[idx].geom = SegChainInfo::finite(first_nonce, new_n, new_last);
                    if let ChainKind::New { unpacked, .. } = &mut self.chains[idx].kind {
                        unpacked.grow_tail(old_max, new_n - 1);
                    }
                    return Ok(());
                }
            }
        }
        self.add_new_finite_chain(delta);
        Ok(())
    }

    /// spec §4.6 `cutFileTo`: truncate the whole geometry to `content_len`.
    pub fn cut_file_to(&mut self, content_len: u64) -> Result<()> {
        self.ensure_not_frozen()?;
        if let Some(total) = self.content_length() {
            if content_len >= total {
                return Ok(());
            }
        }
        if content_len == 0 {
            return self.set_content_length(Some(0));
        }
        let (c, s, p) = self.locations.locate_content_ofs(content_len)?;

        for chain in &self.chains[c + 1..] {
            if let ChainKind::New { unpacked, .. } = &chain.kind {
                if unpacked.has_any_packed(chain.geom.max_seg_index()) {
                    return Err(XspError::SegsPacked(
                        "cannot cut away an already-packed segment".into(),
                    ));
                }
            }
        }

        let remainder = self.truncate_tail(c, s, p)?;
        self.chains.truncate(c);
        self.chains.extend(remainder);
        self.rebuild_locations();
        Ok(())
    }

    /// spec §4.6 `setContentLength`. `None` means "endless".
    pub fn set_content_length(&mut self, len: Option<u64>) -> Result<()> {
        self.ensure_not_frozen()?;
        match len {
            None => {
                if self.is_endless() {
                    return Ok(());
                }
                if self.chains.is_empty() {
                    self.add_new_endless_chain();
                    self.rebuild_locations();
                    return Ok(());
                }
                let idx = self.chains.len() - 1;
                let old_max = self.chains[idx].geom.max_seg_index();
                let growable = matches!(
                    &self.chains[idx].kind,
                    ChainKind::New { unpacked, .. } if unpacked.can_grow_tail(old_max)
                );
                if growable {
                    self.turn_into_endless_chain()?;
                } else {
                    self.add_new_endless_chain();
                }
                self.rebuild_locations();
                Ok(())
            }
            Some(0) => {
                for chain in &self.chains {
                    if let ChainKind::New { unpacked, .. } = &chain.kind {
                        if unpacked.has_any_packed(chain.geom.max_seg_index()) {
                            return Err(XspError::SegsPacked(
                                "cannot drop to zero length with packed new segments".into(),
                            ));
                        }
                    }
                }
                self.chains.clear();
                self.rebuild_locations();
                Ok(())
            }
            Some(target) => {
                match self.content_length() {
                    Some(cur) if target > cur => self.grow_file_by(target - cur),
                    Some(cur) if target < cur => self.cut_file_to(target),
                    Some(_) => Ok(()),
                    None => {
                        let (c, s, p) = self.locations.locate_content_ofs(target)?;
                        debug_assert_eq!(c, self.chains.len() - 1, "only the last chain may be endless");
                        let first_nonce = self.chains[c].geom.first_nonce;
                        let content_in_chain = s as u64 * self.seg_size as u64 + p;
                        let (n, last) = geometry_for(self.seg_size, content_in_chain);
                        self.chains[c].geom = SegChainInfo::finite(first_nonce, n.max(1), last);
                        if let ChainKind::New { unpacked, .. } = &mut self.chains[c].kind {
                            unpacked.cut_tail(n.saturating_sub(1));
                        }
                        self.rebuild_locations();
                        Ok(())
                    }
                }
            }
        }
    }

    fn stride(&self) -> u64 {
        self.seg_size as u64 + POLY as u64
    }

    /// Everything of `chain` strictly before `(seg, pos_in_seg)`, as the
    /// chains that should occupy that position after the cut.
    fn truncate_tail(&mut self, chain_idx: usize, seg: u32, pos_in_seg: u64) -> Result<Vec<Chain>> {
        let seg_size = self.seg_size;
        let chain = self.chains[chain_idx].clone();
        match &chain.kind {
            ChainKind::New { unpacked, head_bytes } => {
                let old_max = chain.geom.max_seg_index();
                let new_max = if pos_in_seg == 0 {
                    seg.checked_sub(1)
                } else {
                    Some(seg)
                };
                let Some(new_max) = new_max else {
                    return Ok(Vec::new());
                };
                if !unpacked.covers_fully(new_max.saturating_add(1), old_max) {
                    return Err(XspError::SegsPacked(
                        "cannot cut through an already-packed new segment".into(),
                    ));
                }
                if pos_in_seg != 0 && !unpacked.needs_packing(seg) {
                    return Err(XspError::SegsPacked(
                        "cannot shrink an already-packed new segment".into(),
                    ));
                }
                let new_content_len = seg as u64 * seg_size as u64 + pos_in_seg;
                if new_content_len == 0 {
                    return Ok(Vec::new());
                }
                let (n, last) = geometry_for(seg_size, new_content_len);
                let mut new_unpacked = unpacked.clone();
                new_unpacked.cut_tail(n - 1);
                let new_head_bytes = head_bytes.map(|hb| {
                    let mut hb = hb;
                    if (hb.len as u64) > new_content_len {
                        hb.len = new_content_len as u32;
                    }
                    hb
                });
                Ok(vec![Chain {
                    geom: SegChainInfo::finite(chain.geom.first_nonce, n, last),
                    kind: ChainKind::New {
                        unpacked: new_unpacked,
                        head_bytes: new_head_bytes,
                    },
                }])
            }
            ChainKind::Base { base_ofs, base_content_ofs } => {
                if pos_in_seg == 0 {
                    if seg == 0 {
                        return Ok(Vec::new());
                    }
                    return Ok(vec![Chain {
                        geom: SegChainInfo::finite(chain.geom.first_nonce, seg, seg_size),
                        kind: ChainKind::Base {
                            base_ofs: *base_ofs,
                            base_content_ofs: *base_content_ofs,
                        },
                    }]);
                }
                let mut out = Vec::new();
                if seg > 0 {
                    out.push(Chain {
                        geom: SegChainInfo::finite(chain.geom.first_nonce, seg, seg_size),
                        kind: ChainKind::Base {
                            base_ofs: *base_ofs,
                            base_content_ofs: *base_content_ofs,
                        },
                    });
                }
                let edge_plain_len = chain.seg_plain_len(seg_size, seg);
                let edge_nonce = calculate_nonce(&chain.geom.first_nonce, seg as u64);
                let edge_packed_ofs = *base_ofs + seg as u64 * self.stride();
                let head_bytes = HeadBytes {
                    len: pos_in_seg as u32,
                    base_packed_ofs: edge_packed_ofs,
                    base_content_ofs: *base_content_ofs + seg as u64 * seg_size as u64,
                    base_plain_len: edge_plain_len,
                    base_nonce: edge_nonce,
                };
                out.push(Chain {
                    geom: SegChainInfo::finite(self.rng.nonce(), 1, pos_in_seg as u32),
                    kind: ChainKind::New {
                        unpacked: NewSegments::all_unpacked(0),
                        head_bytes: Some(head_bytes),
                    },
                });
                Ok(out)
            }
        }
    }

    /// Everything of `chain` at/after `(seg, pos_in_seg)`, as the chains that
    /// should occupy that position after the cut.
    fn truncate_head(&mut self, chain_idx: usize, seg: u32, pos_in_seg: u64) -> Result<Vec<Chain>> {
        let seg_size = self.seg_size;
        let chain = self.chains[chain_idx].clone();
        match &chain.kind {
            ChainKind::New { unpacked, .. } => {
                let old_max = chain.geom.max_seg_index();
                if !unpacked.is_fully_unpacked(old_max) {
                    return Err(XspError::SegsPacked(
                        "cannot head-cut a new chain that already has packed segments".into(),
                    ));
                }
                let old_content_len = chain.geom.content_len(seg_size).unwrap_or(u64::MAX);
                let removed = seg as u64 * seg_size as u64 + pos_in_seg;
                let endless = chain.geom.is_endless();
                if endless {
                    return Ok(vec![Chain {
                        geom: SegChainInfo::endless(chain.geom.first_nonce),
                        kind: ChainKind::New {
                            unpacked: NewSegments::all_unpacked(MAX_SEG_INDEX),
                            head_bytes: None,
                        },
                    }]);
                }
                let new_content_len = old_content_len.saturating_sub(removed);
                if new_content_len == 0 {
                    return Ok(Vec::new());
                }
                let (n, last) = geometry_for(seg_size, new_content_len);
                Ok(vec![Chain {
                    geom: SegChainInfo::finite(chain.geom.first_nonce, n, last),
                    kind: ChainKind::New {
                        unpacked: NewSegments::all_unpacked(n - 1),
                        head_bytes: None,
                    },
                }])
            }
            ChainKind::Base { base_ofs, base_content_ofs } => {
                let n = chain.geom.num_of_segs().unwrap_or(0);
                if pos_in_seg == 0 {
                    if seg == 0 {
                        return Ok(vec![chain]);
                    }
                    if seg >= n {
                        return Ok(Vec::new());
                    }
                    return Ok(vec![Chain {
                        geom: SegChainInfo::finite(
                            chain.geom.first_nonce,
                            n - seg,
                            chain.geom.last_seg_size(seg_size),
                        ),
                        kind: ChainKind::Base {
                            base_ofs: *base_ofs + seg as u64 * self.stride(),
                            base_content_ofs: *base_content_ofs + seg as u64 * seg_size as u64,
                        },
                    }]);
                }
                let edge_plain_len = chain.seg_plain_len(seg_size, seg);
                let edge_nonce = calculate_nonce(&chain.geom.first_nonce, seg as u64);
                let edge_packed_ofs = *base_ofs + seg as u64 * self.stride();
                let borrowed_len = edge_plain_len as u64 - pos_in_seg;
                let mut out = Vec::new();
                if borrowed_len > 0 {
                    out.push(Chain {
                        geom: SegChainInfo::finite(self.rng.nonce(), 1, borrowed_len as u32),
                        kind: ChainKind::New {
                            unpacked: NewSegments::all_unpacked(0),
                            head_bytes: Some(HeadBytes {
                                len: borrowed_len as u32,
                                base_packed_ofs: edge_packed_ofs,
                                base_content_ofs: *base_content_ofs
                                    + seg as u64 * seg_size as u64
                                    + pos_in_seg,
                                base_plain_len: edge_plain_len,
                                base_nonce: edge_nonce,
                            }),
                        },
                    });
                }
                if seg + 1 < n {
                    out.push(Chain {
                        geom: SegChainInfo::finite(
                            chain.geom.first_nonce,
                            n - seg - 1,
                            chain.geom.last_seg_size(seg_size),
                        ),
                        kind: ChainKind::Base {
                            base_ofs: *base_ofs + (seg as u64 + 1) * self.stride(),
                            base_content_ofs: *base_content_ofs + (seg as u64 + 1) * seg_size as u64,
                        },
                    });
                }
                Ok(out)
            }
        }
    }

    /// Both cuts fall within the same chain: produce the left remnant (kept
    /// prefix) and right remnant (kept suffix) independently.
    fn cut_chain_middle(&mut self, chain_idx: usize, ls: u32, lp: u64, rs: u32, rp: u64) -> Result<(Vec<Chain>, Vec<Chain>)> {
        let is_base = self.chains[chain_idx].kind.is_base();
        let left = self.truncate_tail(chain_idx, ls, lp)?;
        if is_base {
            let right = self.truncate_head(chain_idx, rs, rp)?;
            Ok((left, right))
        } else {
            // New chains never carry intact bytes across a cut: the whole
            // deleted-and-beyond span folds into the left-side tail cut.
            Ok((left, Vec::new()))
        }
    }

    /// spec §4.6 `splice`: the general content-editing entry point.
    pub fn splice(&mut self, pos: u64, del: u64, ins: u64) -> Result<()> {
        self.ensure_not_frozen()?;
        if del == 0 && ins == 0 {
            return Ok(());
        }
        if let Some(total) = self.content_length() {
            if pos + del >= total {
                self.cut_file_to(pos)?;
                self.grow_file_by(ins)?;
                return Ok(());
            }
        }

        let (lc, ls, lp) = self.locations.locate_content_ofs(pos)?;
        let (rc, rs, rp) = self.locations.locate_content_ofs(pos + del)?;

        let mut new_chains: Vec<Chain> = self.chains[..lc].to_vec();
        let left_part: Vec<Chain>;
        let right_part: Vec<Chain>;

        if lc == rc {
            let (l, r) = self.cut_chain_middle(lc, ls, lp, rs, rp)?;
            left_part = l;
            right_part = r;
            new_chains.extend(left_part.iter().cloned());
            new_chains.extend(right_part.iter().cloned());
            new_chains.extend(self.chains[rc + 1..].iter().cloned());
        } else {
            for chain in &self.chains[lc + 1..rc] {
                if let ChainKind::New { unpacked, .. } = &chain.kind {
                    if unpacked.has_any_packed(chain.geom.max_seg_index()) {
                        return Err(XspError::SegsPacked(
                            "cannot drop a chain with already-packed segments".into(),
                        ));
                    }
                }
            }
            left_part = self.truncate_tail(lc, ls, lp)?;
            right_part = self.truncate_head(rc, rs, rp)?;
            new_chains.extend(left_part.iter().cloned());
            new_chains.extend(right_part.iter().cloned());
            new_chains.extend(self.chains[rc + 1..].iter().cloned());
        }

        let insertion_at = lc + left_part.len();
        let can_grow_in_place = right_part.is_empty()
            && left_part
                .last()
                .map(|c| match &c.kind {
                    ChainKind::New { unpacked, .. } => unpacked.can_grow_tail(c.geom.max_seg_index()),
                    ChainKind::Base { .. } => false,
                })
                .unwrap_or(false);

        self.chains = new_chains;

        if ins > 0 {
            if can_grow_in_place {
                let idx = insertion_at - 1;
                let old_max = self.chains[idx].geom.max_seg_index();
                let old_content_len = self.chains[idx].geom.content_len(self.seg_size).unwrap();
                let new_content_len = old_content_len + ins;
                let (n, last) = geometry_for(self.seg_size, new_content_len);
                let first_nonce = self.chains[idx].geom.first_nonce;
                self.chains[idx].geom = SegChainInfo::finite(first_nonce, n, last);
                if let ChainKind::New { unpacked, .. } = &mut self.chains[idx].kind {
                    unpacked.grow_tail(old_max, n - 1);
                }
            } else {
                let (n, last) = geometry_for(self.seg_size, ins);
                if n > 0 {
                    let fresh = Chain::new_finite(self.rng.nonce(), n, last);
                    self.chains.insert(insertion_at, fresh);
                }
            }
        }

        self.rebuild_locations();
        Ok(())
    }
}

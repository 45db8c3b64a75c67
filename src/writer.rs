//! `SegmentsWriter` (spec §4.5): wraps a key and a `PackingInfo`, and is
//! the packing contract every caller drives — directly, or through
//! `EncryptingByteSink`.

use std::sync::Arc;

use crate::cryptor::{Cryptor, SegRng};
use crate::error::{Result, XspError};
use crate::header::{decode_header, encode_header};
use crate::key::SegKey;
use crate::layout::{Layout, LayoutSection};
use crate::locations::SegmentInfosIter;
use crate::nonce::{calculate_nonce, Nonce};
use crate::packing::{ChainKind, PackingInfo};
use crate::POLY;

/// Random access to a prior version's packed (ciphertext) byte stream.
/// Used to fetch the borrowed plaintext behind a splice-edge `headBytes`
/// re-encryption, and by the `update` constructor to size a trailing
/// endless base chain.
pub trait BaseSource: Send + Sync {
    fn read_packed_at(&self, ofs: u64, len: u64) -> Result<Vec<u8>>;

    /// Total packed length, if known. A sealed base object is always
    /// finite in packed-byte terms even if its *content* chain is
    /// (`turnEndlessToFinite` needs exactly this number).
    fn total_packed_len(&self) -> u64;
}

/// A segment's coordinates plus writer-specific packing state (spec §4.5:
/// "`WritableSegmentInfo` extended with `{type, needPacking?, headBytes?,
/// baseOfs?, baseContentOfs?}`").
#[derive(Debug, Clone, Copy)]
pub struct WritableSegmentInfo {
    pub chain: usize,
    pub seg: u32,
    pub content_ofs: u64,
    pub content_len: u64,
    pub packed_ofs: u64,
    pub packed_len: u64,
    pub kind: WritableKind,
}

#[derive(Debug, Clone, Copy)]
pub enum WritableKind {
    New {
        need_packing: bool,
        head_bytes_len: Option<u32>,
    },
    Base {
        base_ofs: u64,
        base_content_ofs: u64,
    },
}

/// Wraps a key and a `PackingInfo`. All three constructors (`new`,
/// `restart`, `update`) converge on the same packing/emitting surface.
pub struct SegmentsWriter {
    key: SegKey,
    cryptor: Arc<dyn Cryptor>,
    rng: Arc<dyn SegRng>,
    zeroth_header_nonce: Nonce,
    version: u64,
    header_nonce: Nonce,
    packing: PackingInfo,
    base: Option<Arc<dyn BaseSource>>,
}

impl SegmentsWriter {
    fn header_nonce_for(zeroth: Nonce, version: u64) -> Nonce {
        if version > 0 {
            calculate_nonce(&zeroth, version)
        } else {
            zeroth
        }
    }

    /// Fresh object, no base version: one endless new chain to start
    /// (spec §4.5 `new`).
    pub fn new(
        key: SegKey,
        zeroth_header_nonce: Nonce,
        seg_size_in_256b: u16,
        payload_format: u32,
        version: u64,
        rng: Arc<dyn SegRng>,
        cryptor: Arc<dyn Cryptor>,
    ) -> Result<Self> {
        if seg_size_in_256b == 0 {
            return Err(XspError::ArgsOutOfBounds(
                "segSize/256 must be >= 1".into(),
            ));
        }
        let seg_size = (seg_size_in_256b as u32) << 8;
        let mut packing = PackingInfo::new(seg_size, 1, payload_format, rng.clone());
        packing.set_content_length(None)?;
        Ok(Self {
            key,
            cryptor,
            rng,
            zeroth_header_nonce,
            version,
            header_nonce: Self::header_nonce_for(zeroth_header_nonce, version),
            packing,
            base: None,
        })
    }

    /// Resume writing the same version after a restart (spec §4.5
    /// `restart`): reopens `sealed_header` and re-encrypts exactly the
    /// geometry it describes, under a fresh RNG-independent layout.
    pub fn restart(
        key: SegKey,
        zeroth_header_nonce: Nonce,
        sealed_header: &[u8],
        version: u64,
        rng: Arc<dyn SegRng>,
        cryptor: Arc<dyn Cryptor>,
    ) -> Result<Self> {
        let header_nonce = Self::header_nonce_for(zeroth_header_nonce, version);
        let plain = cryptor.format_wn_open(sealed_header, &key)?;
        let info = decode_header(&plain)?;
        let packing = PackingInfo::from_restart(&info, rng.clone());
        Ok(Self {
            key,
            cryptor,
            rng,
            zeroth_header_nonce,
            version,
            header_nonce,
            packing,
            base: None,
        })
    }

    /// Start a new version on top of a previously sealed base object (spec
    /// §4.5 `update`): every chain starts out as a base reference; a
    /// trailing endless base chain is capped using the base's known total
    /// packed length.
    pub fn update(
        key: SegKey,
        zeroth_header_nonce: Nonce,
        base_version: u64,
        base_sealed_header: &[u8],
        base_source: Arc<dyn BaseSource>,
        payload_format: u32,
        version: u64,
        rng: Arc<dyn SegRng>,
        cryptor: Arc<dyn Cryptor>,
    ) -> Result<Self> {
        let base_header_nonce = Self::header_nonce_for(zeroth_header_nonce, base_version);
        if base_sealed_header.len() < crate::nonce::NONCE_LEN
            || base_sealed_header[..crate::nonce::NONCE_LEN] != base_header_nonce[..]
        {
            return Err(XspError::NonceMismatch);
        }
        let plain = cryptor.format_wn_open(base_sealed_header, &key)?;
        let mut info = decode_header(&plain)?;
        info.payload_format_version = payload_format;
        let header_nonce = Self::header_nonce_for(zeroth_header_nonce, version);

        let mut packing = PackingInfo::from_base(&info, rng.clone());
        if packing.is_endless() {
            let last_idx = packing.chains().len() - 1;
            packing.turn_endless_to_finite_from_packed_len(last_idx, base_source.total_packed_len())?;
        }

        Ok(Self {
            key,
            cryptor,
            rng,
            zeroth_header_nonce,
            version,
            header_nonce,
            packing,
            base: Some(base_source),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn seg_size(&self) -> u32 {
        self.packing.seg_size()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.packing.content_length()
    }

    pub fn is_endless(&self) -> bool {
        self.packing.is_endless()
    }

    pub fn locate_content_ofs(&self, pos: u64) -> Result<(usize, u32, u64)> {
        self.packing.locations().locate_content_ofs(pos)
    }

    pub fn locate_segs_ofs(&self, pos: u64) -> Result<(usize, u32, u64)> {
        self.packing.locations().locate_segs_ofs(pos)
    }

    pub fn set_content_length(&mut self, len: Option<u64>) -> Result<()> {
        self.packing.set_content_length(len)
    }

    pub fn splice(&mut self, pos: u64, del: u64, ins: u64) -> Result<()> {
        self.packing.splice(pos, del, ins)
    }

    fn writable_segment_info(&self, chain_idx: usize, seg: u32) -> Result<WritableSegmentInfo> {
        let geom = self.packing.locations().segment_info(&self.packing.segs_info(), chain_idx, seg)?;
        let chain = self.packing.chain(chain_idx).ok_or_else(|| {
            XspError::UnknownSeg(format!("chain {chain_idx} does not exist"))
        })?;

        match &chain.kind {
            ChainKind::Base {
                base_ofs,
                base_content_ofs,
            } => {
                let stride = self.seg_size() as u64 + POLY as u64;
                Ok(WritableSegmentInfo {
                    chain: chain_idx,
                    seg,
                    content_ofs: geom.content_ofs,
                    content_len: geom.content_len,
                    packed_ofs: geom.packed_ofs,
                    packed_len: geom.packed_len,
                    kind: WritableKind::Base {
                        base_ofs: *base_ofs + seg as u64 * stride,
                        base_content_ofs: *base_content_ofs + seg as u64 * self.seg_size() as u64,
                    },
                })
            }
            ChainKind::New { unpacked, head_bytes } => {
                let need_packing = unpacked.needs_packing(seg);
                let head_len = if seg == 0 { head_bytes.map(|hb| hb.len) } else { None };
                let content_len = geom.content_len - head_len.unwrap_or(0) as u64;
                let content_ofs = geom.content_ofs + head_len.unwrap_or(0) as u64;
                Ok(WritableSegmentInfo {
                    chain: chain_idx,
                    seg,
                    content_ofs,
                    content_len,
                    packed_ofs: geom.packed_ofs,
                    packed_len: geom.packed_len,
                    kind: WritableKind::New {
                        need_packing,
                        head_bytes_len: head_len,
                    },
                })
            }
        }
    }

    pub fn segment_infos(&self, from: Option<(usize, u32)>) -> WritableSegmentInfosIter<'_> {
        WritableSegmentInfosIter {
            writer: self,
            inner: self.packing.locations().segment_infos(
                &self.packing.segs_info(),
                from,
                self.packing.variant_counter(),
            ),
        }
    }

    /// The packing contract (spec §4.5 `packSeg`).
    pub fn pack_seg(&mut self, content: &[u8], seg_id: (usize, u32)) -> Result<Vec<u8>> {
        let (chain_idx, seg) = seg_id;
        let geom = self
            .packing
            .locations()
            .segment_info(&self.packing.segs_info(), chain_idx, seg)?;
        let chain = self
            .packing
            .chain(chain_idx)
            .ok_or_else(|| XspError::UnknownSeg(format!("chain {chain_idx} does not exist")))?
            .clone();

        let (unpacked_needs, head_bytes) = match &chain.kind {
            ChainKind::Base { .. } => {
                return Err(XspError::SegsPacked(
                    "cannot pack a segment of a base chain".into(),
                ))
            }
            ChainKind::New { unpacked, head_bytes } => (unpacked.needs_packing(seg), *head_bytes),
        };
        if !unpacked_needs {
            return Err(XspError::SegsPacked(format!(
                "segment {seg_id:?} is already packed"
            )));
        }

        let expected_len = geom.content_len - if seg == 0 { head_bytes.map(|h| h.len as u64).unwrap_or(0) } else { 0 };
        let mut full_content;
        let content_to_pack: &[u8] = if content.len() as u64 != expected_len {
            if !geom.endless_chain || content.len() as u64 >= expected_len {
                return Err(XspError::ArgsOutOfBounds(format!(
                    "segment {seg_id:?} expects {} bytes, got {}",
                    expected_len,
                    content.len()
                )));
            }
            if self.packing.header_packed() {
                return Err(XspError::HeaderPacked);
            }
            self.packing
                .turn_endless_to_finite_at_seg(chain_idx, seg, content.len() as u64)?;
            content
        } else {
            content
        };

        let content_to_pack = if seg == 0 {
            if let Some(hb) = head_bytes {
                let Some(base) = &self.base else {
                    return Err(XspError::ArgsOutOfBounds(
                        "headBytes chain but no base source bound to this writer".into(),
                    ));
                };
                let borrowed_ct = base.read_packed_at(hb.base_packed_ofs, hb.base_plain_len as u64 + POLY as u64)?;
                let borrowed_plain = self.cryptor.open(&borrowed_ct, &hb.base_nonce, &self.key)?;
                full_content = Vec::with_capacity(hb.len as usize + content_to_pack.len());
                full_content.extend_from_slice(&borrowed_plain[..hb.len as usize]);
                full_content.extend_from_slice(content_to_pack);
                full_content.as_slice()
            } else {
                content_to_pack
            }
        } else {
            content_to_pack
        };

        let nonce = calculate_nonce(&chain.geom.first_nonce, seg as u64);
        let ciphertext = self.cryptor.pack(content_to_pack, &nonce, &self.key)?;
        self.packing.mark_seg_packed(chain_idx, seg)?;
        Ok(ciphertext)
    }

    /// Seals the current geometry as the header, freezing it (spec §4.5
    /// `packHeader`).
    pub fn pack_header(&mut self) -> Result<Vec<u8>> {
        if self.packing.header_packed() {
            return Err(XspError::HeaderPacked);
        }
        let info = self.packing.segs_info();
        let plain = encode_header(&info);
        let sealed = self.cryptor.format_wn_pack(&plain, &self.header_nonce, &self.key)?;
        self.packing.mark_header_packed();
        Ok(sealed)
    }

    /// The new chains whose only segment is entirely borrowed `headBytes`
    /// and not yet packed — edges that need forcing through `pack_seg`
    /// even if the caller never writes into them directly (spec §4.5
    /// `unpackedReencryptChainSegs`).
    pub fn unpacked_reencrypt_chain_segs(&self) -> Vec<(usize, u32)> {
        self.packing
            .chains()
            .iter()
            .enumerate()
            .filter_map(|(idx, chain)| match &chain.kind {
                ChainKind::New { unpacked, head_bytes: Some(_) } if chain.geom.num_of_segs() == Some(1) => {
                    if unpacked.needs_packing(0) {
                        Some((idx, 0))
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect()
    }

    /// Content-space layout: a new chain's first segment is split into a
    /// base head (from `headBytes`) followed by the new tail.
    pub fn show_content_layout(&self) -> Layout {
        let mut layout = Layout::new(self.base_version_for_layout());
        let info = self.packing.segs_info();
        let mut content_cursor = 0u64;

        for chain in self.packing.chains() {
            let content_len = chain.geom.content_len(info.seg_size);
            match &chain.kind {
                ChainKind::Base { base_content_ofs, .. } => {
                    let len = content_len.expect("base chains are always finite");
                    layout.push(LayoutSection::Base {
                        ofs: content_cursor,
                        len,
                        base_ofs: *base_content_ofs,
                    });
                    content_cursor += len;
                }
                ChainKind::New { head_bytes, .. } => {
                    if let Some(hb) = head_bytes {
                        layout.push(LayoutSection::Base {
                            ofs: content_cursor,
                            len: hb.len as u64,
                            base_ofs: hb.base_content_ofs,
                        });
                        content_cursor += hb.len as u64;
                        let total = content_len.expect("headBytes chains are always finite");
                        let tail = total - hb.len as u64;
                        if tail > 0 {
                            layout.push(LayoutSection::New {
                                ofs: content_cursor,
                                len: Some(tail),
                            });
                            content_cursor += tail;
                        }
                    } else {
                        layout.push(LayoutSection::New {
                            ofs: content_cursor,
                            len: content_len,
                        });
                        if let Some(len) = content_len {
                            content_cursor += len;
                        }
                    }
                }
            }
        }
        layout
    }

    /// Packed-space layout: one section per chain (a `headBytes` chain is
    /// wholly new in packed-byte terms — it carries a fresh nonce and
    /// ciphertext distinct from the base segment it borrowed from).
    pub fn show_packed_layout(&self) -> Layout {
        let mut layout = Layout::new(self.base_version_for_layout());
        let info = self.packing.segs_info();
        let mut packed_cursor = 0u64;

        for chain in self.packing.chains() {
            let packed_len = chain
                .geom
                .content_len(info.seg_size)
                .map(|cl| cl + chain.geom.num_of_segs().unwrap_or(0) as u64 * POLY as u64);
            match &chain.kind {
                ChainKind::Base { base_ofs, .. } => {
                    let len = packed_len.expect("base chains are always finite");
                    layout.push(LayoutSection::Base {
                        ofs: packed_cursor,
                        len,
                        base_ofs: *base_ofs,
                    });
                    packed_cursor += len;
                }
                ChainKind::New { .. } => {
                    layout.push(LayoutSection::New {
                        ofs: packed_cursor,
                        len: packed_len,
                    });
                    if let Some(len) = packed_len {
                        packed_cursor += len;
                    }
                }
            }
        }
        layout
    }

    fn base_version_for_layout(&self) -> Option<u64> {
        self.packing
            .chains()
            .iter()
            .any(|c| c.kind.is_base())
            .then_some(self.version.saturating_sub(1))
    }

    /// Zeroes the key ahead of `Drop`.
    pub fn destroy(&mut self) {
        self.key.destroy();
    }
}

/// Iterator over [`WritableSegmentInfo`], the writer-side analog of
/// [`SegmentInfosIter`].
pub struct WritableSegmentInfosIter<'a> {
    writer: &'a SegmentsWriter,
    inner: SegmentInfosIter<'a>,
}

impl<'a> Iterator for WritableSegmentInfosIter<'a> {
    type Item = Result<WritableSegmentInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        Some(match next {
            Ok(geom) => self.writer.writable_segment_info(geom.chain, geom.seg),
            Err(e) => Err(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptor::{OsRng, XChaChaCryptor};

    fn writer() -> SegmentsWriter {
        SegmentsWriter::new(
            SegKey::new([3u8; 32]),
            [1u8; 24],
            16, // 16*256 = 4096
            2,
            0,
            Arc::new(OsRng),
            Arc::new(XChaChaCryptor::new()),
        )
        .unwrap()
    }

    #[test]
    fn finite_roundtrip_via_pack_seg() {
        let mut w = writer();
        w.set_content_length(Some(12344)).unwrap();
        let content = vec![7u8; 12344];
        let mut offset = 0usize;
        for info in w.segment_infos(None).collect::<Vec<_>>() {
            let info = info.unwrap();
            let chunk = &content[offset..offset + info.content_len as usize];
            offset += info.content_len as usize;
            let ct = w.pack_seg(chunk, (info.chain, info.seg)).unwrap();
            assert_eq!(ct.len() as u64, info.packed_len);
        }
        let header = w.pack_header().unwrap();
        assert!(!header.is_empty());
    }

    #[test]
    fn double_pack_same_segment_fails() {
        let mut w = writer();
        w.set_content_length(Some(10)).unwrap();
        w.pack_seg(&[1u8; 10], (0, 0)).unwrap();
        assert!(matches!(w.pack_seg(&[1u8; 10], (0, 0)), Err(XspError::SegsPacked(_))));
    }

    #[test]
    fn splice_after_header_packed_fails() {
        let mut w = writer();
        w.set_content_length(Some(10)).unwrap();
        w.pack_seg(&[1u8; 10], (0, 0)).unwrap();
        w.pack_header().unwrap();
        assert!(matches!(w.splice(0, 1, 1), Err(XspError::HeaderPacked)));
    }
}

//! `SegmentsReader` (spec §4.4): wraps a key and a decoded `SegsInfo`,
//! giving random-access decryption over a packed-segments stream.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::cryptor::Cryptor;
use crate::error::{Result, XspError};
use crate::header::decode_header;
use crate::key::SegKey;
use crate::locations::{Locations, SegmentInfo, SegmentInfosIter};
use crate::nonce::{find_nonce_delta, Nonce};
use crate::segs_info::SegsInfo;

/// Reads segments of one version of an XSP object, given its key and
/// sealed header.
pub struct SegmentsReader {
    key: SegKey,
    cryptor: Arc<dyn Cryptor>,
    version: u64,
    info: SegsInfo,
    locations: Locations,
    variant_counter: Arc<AtomicU64>,
}

impl SegmentsReader {
    /// Opens `sealed_header` under `key`/`cryptor`.
    ///
    /// If `zeroth_header_nonce` is given, validates the header's leading
    /// nonce against it before even attempting to decrypt: the three lanes
    /// must agree on a single delta (else `NonceMismatch`), and that delta
    /// must equal `version` (else `VersionMismatch`). This is the legacy
    /// sealing mode spec §3 calls out ("a legacy header length may also
    /// include a leading nonce lane depending on sealing mode").
    pub fn new(
        key: &SegKey,
        version: u64,
        sealed_header: &[u8],
        cryptor: Arc<dyn Cryptor>,
        zeroth_header_nonce: Option<Nonce>,
    ) -> Result<Self> {
        if let Some(zeroth) = zeroth_header_nonce {
            if sealed_header.len() < crate::nonce::NONCE_LEN {
                return Err(XspError::InputParsing(
                    "sealed header shorter than a nonce".into(),
                ));
            }
            let mut header_nonce: Nonce = [0u8; crate::nonce::NONCE_LEN];
            header_nonce.copy_from_slice(&sealed_header[..crate::nonce::NONCE_LEN]);
            match find_nonce_delta(&zeroth, &header_nonce) {
                None => return Err(XspError::NonceMismatch),
                Some(delta) if delta != version => {
                    return Err(XspError::VersionMismatch {
                        expected: version,
                        actual: delta,
                    })
                }
                Some(_) => {}
            }
        }

        let plain = cryptor.format_wn_open(sealed_header, key)?;
        let info = decode_header(&plain)?;
        let locations = Locations::build(&info, 0);
        let key = SegKey::new(key.0);

        Ok(Self {
            key,
            cryptor,
            version,
            info,
            locations,
            variant_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn format_version(&self) -> u8 {
        self.info.format_version
    }

    /// The §3 header table has no field for this: `decode_header` always
    /// fills it with `0`. A reader opened from a sealed header can never
    /// recover the payload format the writer was constructed with; this
    /// accessor exists for parity with the writer-side field, not because
    /// it carries real information here.
    pub fn payload_format(&self) -> u32 {
        self.info.payload_format_version
    }

    pub fn is_endless_file(&self) -> bool {
        self.locations.is_endless()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.locations.content_length()
    }

    /// Alias for `content_length`, named for parity with the spec's
    /// `contentFiniteLength` (returns `None` for an endless file, exactly
    /// like `content_length`).
    pub fn content_finite_length(&self) -> Option<u64> {
        self.content_length()
    }

    pub fn segments_length(&self) -> Option<u64> {
        self.locations.segments_length()
    }

    pub fn locate_content_ofs(&self, pos: u64) -> Result<(usize, u32, u64)> {
        self.locations.locate_content_ofs(pos)
    }

    pub fn locate_segs_ofs(&self, pos: u64) -> Result<(usize, u32, u64)> {
        self.locations.locate_segs_ofs(pos)
    }

    pub fn segment_info(&self, chain: usize, seg: u32) -> Result<SegmentInfo> {
        self.locations.segment_info(&self.info, chain, seg)
    }

    pub fn segment_infos(&self, from: Option<(usize, u32)>) -> SegmentInfosIter<'_> {
        self.locations
            .segment_infos(&self.info, from, self.variant_counter.clone())
    }

    /// Decrypts one segment. `packed_bytes` must be exactly
    /// `segment_info(seg_id).packed_len` bytes.
    pub fn open_seg(&self, seg_id: (usize, u32), packed_bytes: &[u8]) -> Result<Vec<u8>> {
        let seg_info = self.segment_info(seg_id.0, seg_id.1)?;
        if packed_bytes.len() as u64 != seg_info.packed_len {
            return Err(XspError::ArgsOutOfBounds(format!(
                "segment {:?} expects {} packed bytes, got {}",
                seg_id,
                seg_info.packed_len,
                packed_bytes.len()
            )));
        }
        let chain = &self.info.seg_chains[seg_id.0];
        let nonce = self.locations.segment_nonce(chain, seg_id.0, seg_id.1)?;
        self.cryptor.open(packed_bytes, &nonce, &self.key)
    }

    /// Zeroes the key ahead of `Drop`.
    pub fn destroy(&mut self) {
        self.key.destroy();
    }
}

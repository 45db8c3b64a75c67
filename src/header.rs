//! Header codec: encodes/decodes `SegsInfo` to/from the plaintext bytes
//! that get sealed with `Cryptor::format_wn_pack`.

use crate::error::{Result, XspError};
use crate::nonce::NONCE_LEN;
use crate::segs_info::{ChainGeometry, SegChainInfo, SegsInfo, MAX_SEG_INDEX};

const CHAIN_RECORD_LEN: usize = 31; // 4 (numOfSegs) + 3 (lastSegSize) + 24 (firstNonce)
const FIXED_HEADER_LEN: usize = 3; // formatVersion (1) + segSize/256 (2 BE)

/// Encodes `info` into the header plaintext table.
///
/// Zero-segment chains are omitted (the in-memory model never constructs
/// one in the first place; `PackingInfo` drops chains instead).
pub fn encode_header(info: &SegsInfo) -> Vec<u8> {
    let chain_count = info
        .seg_chains
        .iter()
        .filter(|c| c.num_of_segs().map(|n| n > 0).unwrap_or(true))
        .count();
    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + chain_count * CHAIN_RECORD_LEN);

    out.push(info.format_version);
    let seg_size_256 = (info.seg_size >> 8) as u16;
    out.extend_from_slice(&seg_size_256.to_be_bytes());

    for chain in &info.seg_chains {
        if chain.num_of_segs() == Some(0) {
            continue;
        }
        let (num_of_segs, last_seg_size) = match chain.geometry {
            ChainGeometry::Finite {
                num_of_segs,
                last_seg_size,
            } => (num_of_segs, last_seg_size),
            ChainGeometry::Endless => (MAX_SEG_INDEX, info.seg_size),
        };
        out.extend_from_slice(&num_of_segs.to_be_bytes());
        out.extend_from_slice(&last_seg_size.to_be_bytes()[1..4]);
        out.extend_from_slice(&chain.first_nonce);
    }

    out
}

/// Decodes `bytes` into a `SegsInfo`. The header byte table (spec §3) has
/// no field for `payload_format_version`; the decoded value always carries
/// `0` regardless of what the writer that sealed it was constructed with.
pub fn decode_header(bytes: &[u8]) -> Result<SegsInfo> {
    if bytes.len() < FIXED_HEADER_LEN || (bytes.len() - FIXED_HEADER_LEN) % CHAIN_RECORD_LEN != 0 {
        return Err(XspError::InputParsing(format!(
            "header length {} is not 3 + 31*N",
            bytes.len()
        )));
    }

    let format_version = bytes[0];
    if format_version != 1 && format_version != 2 {
        return Err(XspError::InputParsing(format!(
            "unsupported format version {format_version}"
        )));
    }

    let seg_size_256 = u16::from_be_bytes([bytes[1], bytes[2]]);
    if seg_size_256 == 0 {
        return Err(XspError::InputParsing("segSize/256 must be >= 1".into()));
    }
    let seg_size = (seg_size_256 as u32) << 8;

    let chain_count = (bytes.len() - FIXED_HEADER_LEN) / CHAIN_RECORD_LEN;
    let mut seg_chains = Vec::with_capacity(chain_count);

    for i in 0..chain_count {
        let rec_start = FIXED_HEADER_LEN + i * CHAIN_RECORD_LEN;
        let rec = &bytes[rec_start..rec_start + CHAIN_RECORD_LEN];

        let num_of_segs = u32::from_be_bytes(rec[0..4].try_into().unwrap());
        let mut last_seg_size_buf = [0u8; 4];
        last_seg_size_buf[1..4].copy_from_slice(&rec[4..7]);
        let last_seg_size = u32::from_be_bytes(last_seg_size_buf);

        let mut first_nonce = [0u8; NONCE_LEN];
        first_nonce.copy_from_slice(&rec[7..7 + NONCE_LEN]);

        if num_of_segs == 0 {
            // Zero-segment chains are skipped on decode.
            continue;
        }

        let is_endless_marker = num_of_segs == MAX_SEG_INDEX && last_seg_size == seg_size;
        if is_endless_marker {
            if i != chain_count - 1 {
                return Err(XspError::InputParsing(
                    "endless chain marker must be the last chain".into(),
                ));
            }
            seg_chains.push(SegChainInfo::endless(first_nonce));
        } else {
            if num_of_segs == MAX_SEG_INDEX {
                return Err(XspError::InputParsing(
                    "numOfSegs sentinel without matching lastSegSize == segSize".into(),
                ));
            }
            if last_seg_size == 0 || last_seg_size > seg_size {
                return Err(XspError::InputParsing(format!(
                    "lastSegSize {last_seg_size} out of range for segSize {seg_size}"
                )));
            }
            seg_chains.push(SegChainInfo::finite(first_nonce, num_of_segs, last_seg_size));
        }
    }

    Ok(SegsInfo {
        seg_size,
        format_version,
        payload_format_version: 0,
        seg_chains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::calculate_nonce;

    fn nonce(byte: u8) -> crate::nonce::Nonce {
        [byte; NONCE_LEN]
    }

    #[test]
    fn roundtrip_finite_chains() {
        let mut info = SegsInfo::new(4096, 1, 2);
        info.seg_chains.push(SegChainInfo::finite(nonce(1), 4, 56));
        info.seg_chains
            .push(SegChainInfo::finite(calculate_nonce(&nonce(1), 100), 1, 4096));

        let bytes = encode_header(&info);
        assert_eq!(bytes.len(), 3 + 31 * 2);
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.seg_size, 4096);
        assert_eq!(decoded.format_version, 1);
        assert_eq!(decoded.seg_chains.len(), 2);
        assert_eq!(decoded.seg_chains[0].num_of_segs(), Some(4));
        assert_eq!(decoded.seg_chains[0].last_seg_size(4096), 56);
    }

    #[test]
    fn roundtrip_endless_tail() {
        let mut info = SegsInfo::new(4096, 2, 0);
        info.seg_chains.push(SegChainInfo::finite(nonce(3), 2, 100));
        info.seg_chains.push(SegChainInfo::endless(nonce(9)));

        let bytes = encode_header(&info);
        let decoded = decode_header(&bytes).unwrap();
        assert_eq!(decoded.seg_chains.len(), 2);
        assert!(decoded.seg_chains[1].is_endless());
    }

    #[test]
    fn endless_tail_length_is_65_bytes_for_one_chain() {
        let mut info = SegsInfo::new(4096, 1, 0);
        info.seg_chains.push(SegChainInfo::endless(nonce(1)));
        let bytes = encode_header(&info);
        assert_eq!(bytes.len(), 65);
    }

    #[test]
    fn rejects_endless_marker_not_last() {
        let mut info = SegsInfo::new(4096, 1, 0);
        info.seg_chains.push(SegChainInfo::endless(nonce(1)));
        info.seg_chains.push(SegChainInfo::finite(nonce(2), 1, 10));
        let bytes = encode_header(&info);
        // encode_header doesn't enforce ordering; feed the misordered bytes
        // straight to decode to exercise its validation.
        assert!(decode_header(&bytes).is_err());
    }

    #[test]
    fn rejects_bad_length() {
        assert!(decode_header(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn rejects_bad_format_version() {
        let mut info = SegsInfo::new(4096, 1, 0);
        info.seg_chains.push(SegChainInfo::finite(nonce(1), 1, 10));
        let mut bytes = encode_header(&info);
        bytes[0] = 3;
        assert!(decode_header(&bytes).is_err());
    }
}

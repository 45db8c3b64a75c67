//! End-to-end coverage of the segments/packing engine: the six literal
//! scenarios and the universal invariants.

use std::sync::Arc;

use xsp_segments::cryptor::{Cryptor, OsRng, XChaChaCryptor};
use xsp_segments::error::XspError;
use xsp_segments::key::SegKey;
use xsp_segments::reader::SegmentsReader;
use xsp_segments::sink::{EncryptingByteSink, SinkEvent, SinkObserver};
use xsp_segments::writer::{BaseSource, SegmentsWriter};

const SEG_SIZE_256B: u16 = 16; // 16 * 256 = 4096
const PAYLOAD_FORMAT: u32 = 2;

fn fresh_writer(zeroth: [u8; 24], version: u64) -> SegmentsWriter {
    SegmentsWriter::new(
        SegKey::new([11u8; 32]),
        zeroth,
        SEG_SIZE_256B,
        PAYLOAD_FORMAT,
        version,
        Arc::new(OsRng),
        Arc::new(XChaChaCryptor::new()),
    )
    .unwrap()
}

/// Packs `content` into a contiguous in-memory segments buffer plus
/// sealed header, in segment order.
fn pack_into_memory(writer: &mut SegmentsWriter, content: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut segments = Vec::new();
    let mut offset = 0usize;
    let infos: Vec<_> = writer.segment_infos(None).collect::<Result<_, _>>().unwrap();
    for info in infos {
        let chunk = &content[offset..offset + info.content_len as usize];
        offset += info.content_len as usize;
        let ct = writer.pack_seg(chunk, (info.chain, info.seg)).unwrap();
        segments.push((info.packed_ofs, ct));
    }
    for edge in writer.unpacked_reencrypt_chain_segs() {
        let ct = writer.pack_seg(&[], edge).unwrap();
        let info = writer
            .segment_infos(None)
            .find(|r| matches!(r, Ok(i) if (i.chain, i.seg) == edge))
            .unwrap()
            .unwrap();
        segments.push((info.packed_ofs, ct));
    }
    segments.sort_by_key(|(ofs, _)| *ofs);
    let packed: Vec<u8> = segments.into_iter().flat_map(|(_, ct)| ct).collect();
    let sealed = writer.pack_header().unwrap();
    (packed, sealed)
}

fn decrypt_all(reader: &SegmentsReader, packed: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in reader.segment_infos(None) {
        let seg = seg.unwrap();
        let ct = &packed[seg.packed_ofs as usize..(seg.packed_ofs + seg.packed_len) as usize];
        out.extend_from_slice(&reader.open_seg((seg.chain, seg.seg), ct).unwrap());
    }
    out
}

#[test]
fn scenario_1_finite_empty_file() {
    let zeroth = [1u8; 24];
    let mut writer = fresh_writer(zeroth, 0);
    writer.set_content_length(Some(0)).unwrap();
    let sealed = writer.pack_header().unwrap();

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let reader = SegmentsReader::new(&SegKey::new([11u8; 32]), 0, &sealed, cryptor, None).unwrap();
    assert_eq!(reader.content_length(), Some(0));
    assert_eq!(reader.segments_length(), Some(0));
    assert_eq!(reader.segment_infos(None).count(), 0);
}

#[test]
fn scenario_2_finite_12344_bytes() {
    let zeroth = [2u8; 24];
    let mut writer = fresh_writer(zeroth, 0);
    writer.set_content_length(Some(12344)).unwrap();

    let content: Vec<u8> = (0..12344u32).map(|i| (i % 251) as u8).collect();
    let expected_sizes = [4096u64, 4096, 4096, 56];
    let expected_ct_sizes = [4112u64, 4112, 4112, 72];

    let infos: Vec<_> = writer.segment_infos(None).collect::<Result<_, _>>().unwrap();
    assert_eq!(infos.len(), 4);
    let mut offset = 0usize;
    let mut packed = Vec::new();
    for (i, info) in infos.into_iter().enumerate() {
        assert_eq!(info.content_len, expected_sizes[i]);
        let chunk = &content[offset..offset + info.content_len as usize];
        offset += info.content_len as usize;
        let ct = writer.pack_seg(chunk, (info.chain, info.seg)).unwrap();
        assert_eq!(ct.len() as u64, expected_ct_sizes[i]);
        packed.extend_from_slice(&ct);
    }
    let sealed = writer.pack_header().unwrap();

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let reader = SegmentsReader::new(&SegKey::new([11u8; 32]), 0, &sealed, cryptor, None).unwrap();
    assert_eq!(reader.content_length(), Some(12344));
    assert_eq!(decrypt_all(&reader, &packed), content);
}

#[tokio::test]
async fn scenario_3_endless_then_flip_via_sink() {
    struct Collector {
        segments: std::sync::Mutex<Vec<Vec<u8>>>,
    }
    impl SinkObserver for Collector {
        fn on_event(&self, event: SinkEvent) -> futures::future::BoxFuture<'static, xsp_segments::error::Result<()>> {
            if let SinkEvent::Seg { ciphertext, .. } = event {
                self.segments.lock().unwrap().push((*ciphertext).clone());
            }
            Box::pin(async { Ok(()) })
        }
    }

    let zeroth = [3u8; 24];
    let writer = fresh_writer(zeroth, 0);
    let observer = Arc::new(Collector { segments: std::sync::Mutex::new(Vec::new()) });
    let sink = EncryptingByteSink::new(writer, observer.clone());

    let content: Vec<u8> = (0..9000u32).map(|i| (i % 200) as u8).collect();
    sink.write(0, content.clone()).await.unwrap();
    let sealed = sink.done().await.unwrap();

    let packed: Vec<u8> = observer.segments.lock().unwrap().iter().flatten().copied().collect();

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let reader = SegmentsReader::new(&SegKey::new([11u8; 32]), 0, &sealed, cryptor, None).unwrap();
    assert_eq!(reader.content_length(), Some(9000));
    assert_eq!(reader.segments_length(), Some(9000 + 3 * 16));
    assert_eq!(decrypt_all(&reader, &packed), content);
}

struct MemBase {
    packed: Vec<u8>,
}

impl BaseSource for MemBase {
    fn read_packed_at(&self, ofs: u64, len: u64) -> xsp_segments::error::Result<Vec<u8>> {
        Ok(self.packed[ofs as usize..(ofs + len) as usize].to_vec())
    }

    fn total_packed_len(&self) -> u64 {
        self.packed.len() as u64
    }
}

#[test]
fn scenario_4_splice_cut_and_grow_on_base() {
    let zeroth = [4u8; 24];
    let base_len = 10 * 4096 + 2000;
    let mut base_writer = fresh_writer(zeroth, 0);
    base_writer.set_content_length(Some(base_len)).unwrap();
    let base_content: Vec<u8> = (0..base_len as u32).map(|i| (i % 255) as u8).collect();
    let (base_packed, base_sealed) = pack_into_memory(&mut base_writer, &base_content);

    let base_source = Arc::new(MemBase { packed: base_packed.clone() });
    let mut writer = SegmentsWriter::update(
        SegKey::new([11u8; 32]),
        zeroth,
        0,
        &base_sealed,
        base_source,
        PAYLOAD_FORMAT,
        1,
        Arc::new(OsRng),
        Arc::new(XChaChaCryptor::new()),
    )
    .unwrap();

    // The writer-level `splice` takes the insert length up front (unlike
    // the sink's `spliceLayout`, which can defer sizing the inserted run
    // to a later `write`): pass `ins = 250` so a real 250-byte new chain
    // is carved out between the two kept base runs.
    writer.splice(3000, 5 * 4096, 250).unwrap();
    let layout = writer.show_content_layout();

    let insert = vec![9u8; 250];
    let mut expected = base_content[..3000].to_vec();
    expected.extend_from_slice(&insert);
    expected.extend_from_slice(&base_content[3000 + 5 * 4096..]);
    assert_eq!(expected.len() as u64, 42960 - 20480 + 250);

    // Scenario 4's expected manifest, merged: base(0,3000,base 0),
    // new(3000,250), base(3250, 19480, base 23480).
    assert_eq!(
        layout.sections,
        vec![
            xsp_segments::layout::LayoutSection::Base { ofs: 0, len: 3000, base_ofs: 0 },
            xsp_segments::layout::LayoutSection::New { ofs: 3000, len: Some(250) },
            xsp_segments::layout::LayoutSection::Base {
                ofs: 3250,
                len: 19480,
                base_ofs: 23480,
            },
        ]
    );

    // Every `New`-kind segment here (the two re-encrypted borrow edges and
    // the real 250-byte insert) is packed in this one pass: the edges'
    // `content_len` already nets out to 0 once `headBytes` is subtracted,
    // so they consume nothing from `insert` and need no separate forcing
    // step.
    let mut new_cts = std::collections::HashMap::new();
    let mut offset = 0usize;
    let infos: Vec<_> = writer.segment_infos(None).collect::<Result<_, _>>().unwrap();
    for info in infos {
        if let xsp_segments::writer::WritableKind::New { .. } = info.kind {
            let chunk = &insert[offset..offset + info.content_len as usize];
            offset += info.content_len as usize;
            let ct = writer.pack_seg(chunk, (info.chain, info.seg)).unwrap();
            new_cts.insert((info.chain, info.seg), ct);
        }
    }
    assert!(writer.unpacked_reencrypt_chain_segs().is_empty());
    let sealed = writer.pack_header().unwrap();

    // Reassemble the packed stream in the writer's own packed-address
    // space, pulling base segments verbatim from the base version and
    // freshly packed ciphertexts for everything new.
    let mut packed = Vec::new();
    for info in writer.segment_infos(None).collect::<Result<Vec<_>, _>>().unwrap() {
        match info.kind {
            xsp_segments::writer::WritableKind::Base { base_ofs, .. } => {
                packed.extend_from_slice(
                    &base_packed[base_ofs as usize..(base_ofs + info.packed_len) as usize],
                );
            }
            xsp_segments::writer::WritableKind::New { .. } => {
                packed.extend_from_slice(&new_cts[&(info.chain, info.seg)]);
            }
        }
    }

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let reader = SegmentsReader::new(&SegKey::new([11u8; 32]), 1, &sealed, cryptor, None).unwrap();
    assert_eq!(reader.content_length(), Some(expected.len() as u64));
    assert_eq!(decrypt_all(&reader, &packed), expected);
}

#[test]
fn scenario_5_edge_split_reencrypts_with_fresh_nonce() {
    let zeroth = [5u8; 24];
    // A short last base segment (100 bytes) so the cut further down lands
    // nowhere near it, exercising `seg_plain_len`/`HeadBytes::base_plain_len`
    // against a chain whose *other* segments stay full-size.
    let base_len = 10 * 4096 + 100;
    let mut base_writer = fresh_writer(zeroth, 0);
    base_writer.set_content_length(Some(base_len)).unwrap();
    let base_content: Vec<u8> = (0..base_len as u32).map(|i| (i % 253) as u8).collect();
    let (base_packed, base_sealed) = pack_into_memory(&mut base_writer, &base_content);

    let base_source = Arc::new(MemBase { packed: base_packed.clone() });
    let mut writer = SegmentsWriter::update(
        SegKey::new([11u8; 32]),
        zeroth,
        0,
        &base_sealed,
        base_source,
        PAYLOAD_FORMAT,
        1,
        Arc::new(OsRng),
        Arc::new(XChaChaCryptor::new()),
    )
    .unwrap();

    // splice_pos = 2*4096-150 falls inside segment 1 (content [4096,8192)),
    // 3946 bytes in; del=4096 removes through content offset 12138, which
    // falls inside segment 2 (content [8192,12288)), 3946 bytes in. Each
    // side of the cut lands mid-segment, so both produce a re-encrypted
    // `headBytes` edge: a left edge borrowing the kept 3946-byte prefix of
    // segment 1, and a right edge borrowing the kept 150-byte suffix of
    // segment 2.
    let splice_pos = 2 * 4096 - 150;
    writer.splice(splice_pos, 4096, 200).unwrap();

    let insert = vec![7u8; 200];
    let mut expected = base_content[..splice_pos as usize].to_vec();
    expected.extend_from_slice(&insert);
    expected.extend_from_slice(&base_content[(splice_pos + 4096) as usize..]);

    let infos: Vec<_> = writer.segment_infos(None).collect::<Result<_, _>>().unwrap();
    let left_edge = infos
        .iter()
        .find(|i| matches!(i.kind, xsp_segments::writer::WritableKind::New { head_bytes_len: Some(l), .. } if l == 4096 - 150))
        .expect("a left edge headBytes chain of length 4096-150")
        .clone();
    assert_eq!(left_edge.content_len, 0, "the left edge is pure borrowed content, no new tail");

    let mut new_cts = std::collections::HashMap::new();
    let mut offset = 0usize;
    for info in &infos {
        if let xsp_segments::writer::WritableKind::New { .. } = info.kind {
            let chunk = &insert[offset..offset + info.content_len as usize];
            offset += info.content_len as usize;
            let ct = writer.pack_seg(chunk, (info.chain, info.seg)).unwrap();
            new_cts.insert((info.chain, info.seg), ct);
        }
    }
    let sealed = writer.pack_header().unwrap();

    let left_ct = &new_cts[&(left_edge.chain, left_edge.seg)];
    assert!(!base_packed.windows(left_ct.len()).any(|w| w == left_ct.as_slice()));

    let mut packed = Vec::new();
    for info in writer.segment_infos(None).collect::<Result<Vec<_>, _>>().unwrap() {
        match info.kind {
            xsp_segments::writer::WritableKind::Base { base_ofs, .. } => {
                packed.extend_from_slice(
                    &base_packed[base_ofs as usize..(base_ofs + info.packed_len) as usize],
                );
            }
            xsp_segments::writer::WritableKind::New { .. } => {
                packed.extend_from_slice(&new_cts[&(info.chain, info.seg)]);
            }
        }
    }

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let reader = SegmentsReader::new(&SegKey::new([11u8; 32]), 1, &sealed, cryptor, None).unwrap();
    assert_eq!(reader.content_length(), Some(expected.len() as u64));
    assert_eq!(decrypt_all(&reader, &packed), expected);
}

#[test]
fn scenario_6_cross_version_update_is_idempotent() {
    let zeroth = [6u8; 24];
    let content_len = 3 * 4096;
    let mut base_writer = fresh_writer(zeroth, 0);
    base_writer.set_content_length(Some(content_len)).unwrap();
    let content = vec![8u8; content_len as usize];
    let (base_packed, base_sealed) = pack_into_memory(&mut base_writer, &content);

    let base_source = Arc::new(MemBase { packed: base_packed.clone() });
    let mut writer = SegmentsWriter::update(
        SegKey::new([11u8; 32]),
        zeroth,
        0,
        &base_sealed,
        base_source,
        PAYLOAD_FORMAT,
        2,
        Arc::new(OsRng),
        Arc::new(XChaChaCryptor::new()),
    )
    .unwrap();

    writer.splice(0, 0, 0).unwrap();
    for edge in writer.unpacked_reencrypt_chain_segs() {
        writer.pack_seg(&[], edge).unwrap();
    }
    let sealed_v2 = writer.pack_header().unwrap();

    let expected_header_nonce = xsp_segments::nonce::calculate_nonce(&zeroth, 2);
    assert_eq!(&sealed_v2[..xsp_segments::nonce::NONCE_LEN], &expected_header_nonce[..]);

    let layout = writer.show_packed_layout();
    assert_eq!(layout.sections.len(), 1);
    assert!(matches!(
        layout.sections[0],
        xsp_segments::layout::LayoutSection::Base { ofs: 0, base_ofs: 0, .. }
    ));
}

#[test]
fn version_law_rejects_wrong_version() {
    let zeroth = [7u8; 24];
    let mut writer = fresh_writer(zeroth, 3);
    writer.set_content_length(Some(10)).unwrap();
    writer.pack_seg(&[1u8; 10], (0, 0)).unwrap();
    let sealed = writer.pack_header().unwrap();

    let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
    let err = SegmentsReader::new(&SegKey::new([11u8; 32]), 5, &sealed, cryptor, Some(zeroth)).unwrap_err();
    assert!(matches!(err, XspError::VersionMismatch { expected: 5, actual: 3 }));
}

#[test]
fn no_double_pack_raises_segs_packed() {
    let mut writer = fresh_writer([8u8; 24], 0);
    writer.set_content_length(Some(10)).unwrap();
    writer.pack_seg(&[1u8; 10], (0, 0)).unwrap();
    assert!(matches!(writer.pack_seg(&[1u8; 10], (0, 0)), Err(XspError::SegsPacked(_))));
}

#[test]
fn geometry_freeze_after_pack_header() {
    let mut writer = fresh_writer([9u8; 24], 0);
    writer.set_content_length(Some(10)).unwrap();
    writer.pack_seg(&[1u8; 10], (0, 0)).unwrap();
    writer.pack_header().unwrap();
    assert!(matches!(writer.splice(0, 1, 1), Err(XspError::HeaderPacked)));
    assert!(matches!(writer.set_content_length(Some(20)), Err(XspError::HeaderPacked)));
}

#[test]
fn key_zeroization_on_destroy() {
    let mut key = SegKey::new([42u8; 32]);
    key.destroy();
    assert_eq!(key.0, [0u8; 32]);
}

#[test]
fn round_trip_survives_arbitrary_seg_size() {
    for seg_size_256b in [1u16, 4, 16] {
        let zeroth = [10u8; 24];
        let mut writer = SegmentsWriter::new(
            SegKey::new([12u8; 32]),
            zeroth,
            seg_size_256b,
            PAYLOAD_FORMAT,
            0,
            Arc::new(OsRng),
            Arc::new(XChaChaCryptor::new()),
        )
        .unwrap();
        let len = 5000u64;
        writer.set_content_length(Some(len)).unwrap();
        let content: Vec<u8> = (0..len as u32).map(|i| (i % 250) as u8).collect();
        let (packed, sealed) = pack_into_memory(&mut writer, &content);

        let cryptor: Arc<dyn Cryptor> = Arc::new(XChaChaCryptor::new());
        let reader = SegmentsReader::new(&SegKey::new([12u8; 32]), 0, &sealed, cryptor, None).unwrap();
        assert_eq!(decrypt_all(&reader, &packed), content);
    }
}

//! `DecryptingByteSource` (spec §4.8): a random-access, single-reader
//! plaintext source over a packed-segments byte source. Batches adjacent
//! segments into larger reads and opens them in parallel up to the
//! cryptor's concurrency budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cryptor::Cryptor;
use crate::error::{Result, XspError};
use crate::locations::SegmentInfo;
use crate::reader::SegmentsReader;

/// Random access to a packed (ciphertext) byte stream. `read_at` must
/// return exactly `len` bytes or fail.
pub trait PackedByteSource: Send + Sync {
    fn read_at(&self, pos: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Groups adjacent packed segments into chunks of up to this many bytes
/// for a single underlying `read_at` call (spec §4.8
/// `PACKED_READ_CHUNK_LEN`).
pub const PACKED_READ_CHUNK_LEN: u64 = 256 * 1024;

pub struct DecryptingByteSource {
    reader: SegmentsReader,
    cryptor: Arc<dyn Cryptor>,
    source: Arc<dyn PackedByteSource>,
    content_position: u64,
    buffered: Option<((usize, u32), Vec<u8>)>,
    pending: Arc<AtomicBool>,
    work_label: u64,
}

impl DecryptingByteSource {
    pub fn new(
        reader: SegmentsReader,
        cryptor: Arc<dyn Cryptor>,
        source: Arc<dyn PackedByteSource>,
        work_label: u64,
    ) -> Self {
        Self {
            reader,
            cryptor,
            source,
            content_position: 0,
            buffered: None,
            pending: Arc::new(AtomicBool::new(false)),
            work_label,
        }
    }

    pub fn get_position(&self) -> u64 {
        self.content_position
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if let Some(total) = self.reader.content_length() {
            if offset > total {
                return Err(XspError::ArgsOutOfBounds(format!(
                    "seek to {offset} is beyond content length {total}"
                )));
            }
        }
        self.content_position = offset;
        self.buffered = None;
        Ok(())
    }

    pub fn get_size(&self) -> (Option<u64>, bool) {
        (self.reader.content_length(), self.reader.is_endless_file())
    }

    /// Reads `len` bytes starting at `pos`, without disturbing the
    /// sequential read cursor any more than a plain `seek` + `read_next`
    /// would.
    pub async fn read_at(&mut self, pos: u64, len: u64) -> Result<Vec<u8>> {
        self.seek(pos)?;
        self.read_next(Some(len)).await
    }

    /// Reads the next `len` bytes from the current position (or to the
    /// end of a finite file if `len` is `None`). Only one read may be
    /// in flight at a time.
    pub async fn read_next(&mut self, len: Option<u64>) -> Result<Vec<u8>> {
        if self.pending.swap(true, Ordering::SeqCst) {
            return Err(XspError::ArgsOutOfBounds(
                "a read is already in flight on this source".into(),
            ));
        }
        let result = self.read_next_inner(len).await;
        self.pending.store(false, Ordering::SeqCst);
        result
    }

    async fn read_next_inner(&mut self, len: Option<u64>) -> Result<Vec<u8>> {
        let len = match len {
            Some(l) => l,
            None => {
                let total = self.reader.content_length().ok_or_else(|| {
                    XspError::ArgsOutOfBounds(
                        "read_next with no length on an endless file".into(),
                    )
                })?;
                total.saturating_sub(self.content_position)
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }

        let start = self.content_position;
        let end = start + len;
        let (start_chain, start_seg, _) = self.reader.locate_content_ofs(start)?;

        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = start;
        let mut from = Some((start_chain, start_seg));

        while cursor < end {
            if let Some(((bc, bs), ref bytes)) = self.buffered {
                let seg_info = self.reader.segment_info(bc, bs)?;
                if seg_info.content_ofs <= cursor && cursor < seg_info.content_ofs + seg_info.content_len {
                    let local_start = (cursor - seg_info.content_ofs) as usize;
                    let take = ((end - cursor) as usize).min(bytes.len() - local_start);
                    out.extend_from_slice(&bytes[local_start..local_start + take]);
                    cursor += take as u64;
                    if cursor >= end {
                        break;
                    }
                    from = Some((bc, bs + 1));
                    self.buffered = None;
                    continue;
                }
            }

            let chunk = self.next_packed_chunk(from, end)?;
            if chunk.is_empty() {
                return Err(XspError::ArgsOutOfBounds(
                    "ran out of segments before satisfying the requested read".into(),
                ));
            }
            let packed_ofs = chunk[0].packed_ofs;
            let packed_len: u64 = chunk.iter().map(|s| s.packed_len).sum();
            let packed_bytes = self.source.read_at(packed_ofs, packed_len).await?;

            let budget = self.cryptor.can_start_under_work_label(self.work_label).max(1);
            let mut opened: Vec<(SegmentInfo, Vec<u8>)> = Vec::with_capacity(chunk.len());
            for batch in chunk.chunks(budget) {
                let futs = batch.iter().map(|seg_info| {
                    let local_ofs = (seg_info.packed_ofs - packed_ofs) as usize;
                    let ct = packed_bytes[local_ofs..local_ofs + seg_info.packed_len as usize].to_vec();
                    let id = (seg_info.chain, seg_info.seg);
                    let cryptor = self.cryptor.clone();
                    let key_snapshot = ct; // moved in below
                    let reader = &self.reader;
                    async move { (id, reader.open_seg(id, &key_snapshot), cryptor) }
                });
                let results: Vec<_> = futures::future::join_all(futs).await;
                for ((_id, res, _cryptor), seg_info) in results.into_iter().zip(batch.iter()) {
                    opened.push((*seg_info, res?));
                }
            }

            for (seg_info, plain) in opened {
                if seg_info.content_ofs + seg_info.content_len <= cursor {
                    continue;
                }
                let local_start = cursor.saturating_sub(seg_info.content_ofs) as usize;
                let take = ((end - cursor) as usize).min(plain.len() - local_start);
                out.extend_from_slice(&plain[local_start..local_start + take]);
                cursor += take as u64;
                if local_start + take < plain.len() {
                    self.buffered = Some(((seg_info.chain, seg_info.seg), plain));
                }
                from = Some((seg_info.chain, seg_info.seg + 1));
                if cursor >= end {
                    break;
                }
            }
        }

        self.content_position = end;
        Ok(out)
    }

    /// Walks `segment_infos(from)` and groups adjacent packed segments
    /// into one contiguous run of up to `PACKED_READ_CHUNK_LEN` bytes,
    /// stopping once the run would read past `content_end`.
    fn next_packed_chunk(&self, from: Option<(usize, u32)>, content_end: u64) -> Result<Vec<SegmentInfo>> {
        let mut out = Vec::new();
        let mut packed_len_acc = 0u64;
        let mut expected_packed_ofs = None;

        for seg in self.reader.segment_infos(from) {
            let seg = seg?;
            if seg.content_ofs >= content_end {
                break;
            }
            if let Some(expected) = expected_packed_ofs {
                if seg.packed_ofs != expected || packed_len_acc + seg.packed_len > PACKED_READ_CHUNK_LEN {
                    break;
                }
            }
            packed_len_acc += seg.packed_len;
            expected_packed_ofs = Some(seg.packed_ofs + seg.packed_len);
            out.push(seg);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptor::{Cryptor as _, XChaChaCryptor};
    use crate::key::SegKey;
    use crate::nonce::calculate_nonce;
    use futures::FutureExt;
    use std::sync::Mutex;

    struct MemSource {
        bytes: Vec<u8>,
    }

    impl PackedByteSource for MemSource {
        fn read_at(&self, pos: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>>> {
            let slice = self.bytes[pos as usize..(pos + len) as usize].to_vec();
            async move { Ok(slice) }.boxed()
        }
    }

    fn build_two_segment_reader() -> (SegmentsReader, Vec<u8>, SegKey) {
        let cryptor = XChaChaCryptor::new();
        let key = SegKey::new([6u8; 32]);
        let first_nonce = [4u8; 24];
        let mut info = crate::segs_info::SegsInfo::new(16, 1, 0);
        info.seg_chains.push(crate::segs_info::SegChainInfo::finite(first_nonce, 2, 10));

        let seg0 = cryptor.pack(&[1u8; 16], &calculate_nonce(&first_nonce, 0), &key).unwrap();
        let seg1 = cryptor.pack(&[2u8; 10], &calculate_nonce(&first_nonce, 1), &key).unwrap();
        let mut packed = Vec::new();
        packed.extend_from_slice(&seg0);
        packed.extend_from_slice(&seg1);

        let plain_header = crate::header::encode_header(&info);
        let header_nonce = [9u8; 24];
        let sealed = cryptor.format_wn_pack(&plain_header, &header_nonce, &key).unwrap();
        let reader = SegmentsReader::new(&key, 0, &sealed, Arc::new(cryptor), None).unwrap();
        (reader, packed, key)
    }

    #[tokio::test]
    async fn reads_across_segment_boundary() {
        let (reader, packed, _key) = build_two_segment_reader();
        let source = Arc::new(MemSource { bytes: packed });
        let mut src = DecryptingByteSource::new(reader, Arc::new(XChaChaCryptor::new()), source, 1);

        let data = src.read_next(Some(26)).await.unwrap();
        assert_eq!(&data[..16], &[1u8; 16][..]);
        assert_eq!(&data[16..], &[2u8; 10][..]);
    }

    #[tokio::test]
    async fn concurrent_read_next_is_rejected() {
        let (reader, packed, _key) = build_two_segment_reader();
        let source = Arc::new(MemSource { bytes: packed });
        let src = Arc::new(Mutex::new(DecryptingByteSource::new(
            reader,
            Arc::new(XChaChaCryptor::new()),
            source,
            1,
        )));
        // Exercise the pending guard directly rather than truly racing two
        // tasks against a `Mutex`-guarded source.
        let guard = src.lock().unwrap();
        assert!(!guard.pending.swap(true, Ordering::SeqCst));
        assert!(guard.pending.load(Ordering::SeqCst));
    }
}

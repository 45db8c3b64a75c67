//! `EncryptingObjSource`: adapts a forward-only plaintext reader into a
//! sealed XSP object, by driving a [`SegmentsWriter`]
//! sequentially instead of through the out-of-order contract
//! [`crate::sink::EncryptingByteSink`] offers.
//!
//! This is the streaming-upload shape: plaintext arrives once, in order,
//! and is never re-read, so there's no need for `EncryptingByteSink`'s
//! overlap tracking or buffering — each segment is packed the moment
//! enough plaintext has accumulated for it.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::writer::SegmentsWriter;

/// A forward-only plaintext source: each call returns the next chunk (up
/// to `max_len` bytes), or `None` at end of stream. Never seeks backward.
pub trait ObjSource: Send {
    fn read(&mut self, max_len: u64) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;
}

/// Emitted as segments are packed and, finally, once the header is
/// sealed.
pub enum ObjSourceEvent {
    Seg { seg_id: (usize, u32), ciphertext: Vec<u8> },
    Header { sealed: Vec<u8> },
}

/// Drives `source` to completion, packing one segment at a time and
/// invoking `on_event` for each. Returns the sealed header.
pub struct EncryptingObjSource<S> {
    writer: SegmentsWriter,
    source: S,
    pending: Vec<u8>,
    seg_size: u64,
    next_seg: u32,
}

impl<S: ObjSource> EncryptingObjSource<S> {
    pub fn new(writer: SegmentsWriter, source: S) -> Self {
        let seg_size = writer.seg_size() as u64;
        Self {
            writer,
            source,
            pending: Vec::new(),
            seg_size,
            next_seg: 0,
        }
    }

    /// Reads `source` to exhaustion, packing whole segments as they fill
    /// and the final (possibly short) segment at end of stream, then
    /// seals and returns the header.
    pub async fn run(
        mut self,
        mut on_event: impl FnMut(ObjSourceEvent) -> BoxFuture<'static, Result<()>>,
    ) -> Result<Vec<u8>> {
        self.writer.set_content_length(None)?;
        let mut total = 0u64;

        loop {
            let want = self.seg_size - self.pending.len() as u64;
            let chunk = self.source.read(want).await?;
            match chunk {
                Some(bytes) if !bytes.is_empty() => {
                    total += bytes.len() as u64;
                    self.pending.extend_from_slice(&bytes);
                    if self.pending.len() as u64 == self.seg_size {
                        self.flush_segment(&mut on_event, false).await?;
                    }
                }
                _ => {
                    if !self.pending.is_empty() {
                        self.flush_segment(&mut on_event, true).await?;
                    }
                    break;
                }
            }
        }

        // A short final segment above already finalized the trailing
        // endless chain via `packSeg`'s implicit EOF detection. But a
        // stream whose length is an exact multiple of `seg_size` (or
        // empty) never packs a short segment, so the tail is still
        // endless here; closing it explicitly is what turns a truly
        // empty stream into zero chains (spec §4.6 `setContentLength(0)`)
        // and an exact-multiple stream into a properly finite tail.
        self.writer.set_content_length(Some(total))?;

        let sealed = self.writer.pack_header()?;
        on_event(ObjSourceEvent::Header {
            sealed: sealed.clone(),
        })
        .await?;
        Ok(sealed)
    }

    async fn flush_segment(
        &mut self,
        on_event: &mut impl FnMut(ObjSourceEvent) -> BoxFuture<'static, Result<()>>,
        is_final: bool,
    ) -> Result<()> {
        let content = std::mem::take(&mut self.pending);
        let seg_id = (0, self.next_seg);
        let ciphertext = self.writer.pack_seg(&content, seg_id)?;
        self.next_seg += 1;
        let _ = is_final;
        on_event(ObjSourceEvent::Seg {
            seg_id,
            ciphertext,
        })
        .await
    }
}

/// An [`ObjSource`] over an in-memory byte slice, handed whole chunks by
/// `Arc` so tests don't need a real async I/O source.
pub struct SliceObjSource {
    bytes: Arc<Vec<u8>>,
    pos: usize,
}

impl SliceObjSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            pos: 0,
        }
    }
}

impl ObjSource for SliceObjSource {
    fn read(&mut self, max_len: u64) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let remaining = self.bytes.len() - self.pos;
        if remaining == 0 {
            return Box::pin(async { Ok(None) });
        }
        let take = (max_len as usize).min(remaining);
        let out = self.bytes[self.pos..self.pos + take].to_vec();
        self.pos += take;
        Box::pin(async move { Ok(Some(out)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptor::{Cryptor as _, OsRng, XChaChaCryptor};
    use crate::key::SegKey;
    use std::sync::Mutex;

    fn writer() -> SegmentsWriter {
        SegmentsWriter::new(
            SegKey::new([4u8; 32]),
            [7u8; 24],
            1, // 256-byte segments
            0,
            0,
            Arc::new(OsRng),
            Arc::new(XChaChaCryptor::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn streams_whole_and_partial_segments() {
        let source = SliceObjSource::new(vec![9u8; 700]);
        let adapter = EncryptingObjSource::new(writer(), source);

        let segs = Arc::new(Mutex::new(Vec::new()));
        let segs_clone = segs.clone();
        let sealed = adapter
            .run(move |event| {
                let segs = segs_clone.clone();
                Box::pin(async move {
                    if let ObjSourceEvent::Seg { seg_id, ciphertext } = event {
                        segs.lock().unwrap().push((seg_id, ciphertext.len()));
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(!sealed.is_empty());
        let segs = segs.lock().unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].0, (0, 2));
    }

    #[tokio::test]
    async fn empty_stream_seals_a_zero_chain_header() {
        let source = SliceObjSource::new(Vec::new());
        let adapter = EncryptingObjSource::new(writer(), source);
        let sealed = adapter
            .run(|_event| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert!(!sealed.is_empty());

        let cryptor = XChaChaCryptor::new();
        let plain = cryptor.format_wn_open(&sealed, &SegKey::new([4u8; 32])).unwrap();
        let info = crate::header::decode_header(&plain).unwrap();
        assert!(info.seg_chains.is_empty());
    }

    #[tokio::test]
    async fn exact_multiple_of_seg_size_finalizes_to_finite() {
        // 512 == 2 * seg_size(256): the loop packs two whole segments and
        // never sees a short final one, so the trailing chain must be
        // closed out explicitly rather than left endless.
        let source = SliceObjSource::new(vec![3u8; 512]);
        let adapter = EncryptingObjSource::new(writer(), source);
        let sealed = adapter
            .run(|_event| Box::pin(async { Ok(()) }))
            .await
            .unwrap();

        let cryptor = XChaChaCryptor::new();
        let plain = cryptor.format_wn_open(&sealed, &SegKey::new([4u8; 32])).unwrap();
        let info = crate::header::decode_header(&plain).unwrap();
        assert_eq!(info.seg_chains.len(), 1);
        assert!(!info.seg_chains[0].is_endless());
        assert_eq!(info.seg_chains[0].num_of_segs(), Some(2));
        assert_eq!(info.seg_chains[0].last_seg_size(256), 256);
    }
}

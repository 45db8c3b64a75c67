//! `EncryptingByteSink` (spec §4.7): turns out-of-order, overlap-free
//! plaintext writes into packed segments, through a `SegmentsWriter`.
//!
//! Calls are serialized through a single-slot actor — a background task
//! owning the `SegmentsWriter`, reached by an `mpsc` command channel with a
//! `oneshot` reply per call — the same shape `deadrop`'s streaming upload
//! handler uses to keep one writer behind one mutating task instead of a
//! lock held across `.await` points.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, XspError};
use crate::layout::Layout;
use crate::locations::SegmentInfo;
use crate::writer::{SegmentsWriter, WritableKind};

/// Emitted to an observer as segments and the final header become ready.
/// The sink never buffers these; it's the observer's job to forward them
/// to storage.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Seg {
        seg_id: (usize, u32),
        ciphertext: Arc<Vec<u8>>,
        seg_info: SegmentInfo,
    },
    Header {
        sealed: Arc<Vec<u8>>,
        layout: Layout,
    },
}

/// Receives `SinkEvent`s and, optionally, applies backpressure between
/// them. `on_event` returning a future lets an observer await a slow
/// downstream write (e.g. a network PUT) before the sink proceeds to pack
/// further segments ahead of it.
pub trait SinkObserver: Send + Sync {
    fn on_event(&self, event: SinkEvent) -> BoxFuture<'static, Result<()>>;
}

/// Buffers partial-segment writes, keyed by content offset, until a
/// contiguous run exactly covers one or more whole segments.
#[derive(Default)]
struct ChunksBuffer {
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl ChunksBuffer {
    fn end_of(ofs: u64, bytes: &[u8]) -> u64 {
        ofs + bytes.len() as u64
    }

    /// Errors if `[ofs, ofs+bytes.len())` overlaps an already-buffered
    /// range: every write must cover disjoint content, spec §4.7's
    /// "overlap-free" contract.
    fn ensure_no_overlap(&self, ofs: u64, bytes: &[u8]) -> Result<()> {
        let end = Self::end_of(ofs, bytes);
        for (&existing_ofs, existing) in &self.chunks {
            let existing_end = Self::end_of(existing_ofs, existing);
            if ofs < existing_end && existing_ofs < end {
                return Err(XspError::ArgsOutOfBounds(format!(
                    "write [{ofs}, {end}) overlaps a buffered write [{existing_ofs}, {existing_end})"
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, ofs: u64, bytes: Vec<u8>) {
        self.chunks.insert(ofs, bytes);
        self.merge_adjacent();
    }

    fn merge_adjacent(&mut self) {
        let mut merged: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for (ofs, bytes) in std::mem::take(&mut self.chunks) {
            if let Some((&last_ofs, last)) = merged.iter_mut().next_back() {
                if last_ofs + last.len() as u64 == ofs {
                    last.extend_from_slice(&bytes);
                    continue;
                }
            }
            merged.insert(ofs, bytes);
        }
        self.chunks = merged;
    }

    /// Extracts exactly `[ofs, ofs+len)` if some buffered, merged run
    /// fully covers it.
    fn try_extract(&mut self, ofs: u64, len: u64) -> Option<Vec<u8>> {
        let end = ofs + len;
        let (&run_ofs, run) = self
            .chunks
            .range(..=ofs)
            .next_back()
            .filter(|(&run_ofs, run)| run_ofs <= ofs && run_ofs + run.len() as u64 >= end)?;
        let local_start = (ofs - run_ofs) as usize;
        let out = run[local_start..local_start + len as usize].to_vec();

        let run_end = run_ofs + run.len() as u64;
        let run = self.chunks.remove(&run_ofs).unwrap();
        if local_start > 0 {
            self.chunks.insert(run_ofs, run[..local_start].to_vec());
        }
        if (local_start + len as usize) < run.len() {
            self.chunks
                .insert(end, run[local_start + len as usize..].to_vec());
        }
        debug_assert!(run_end >= end);
        Some(out)
    }
}

enum Command {
    SetContentLength(Option<u64>, oneshot::Sender<Result<()>>),
    GetSize(oneshot::Sender<Result<(Option<u64>, bool)>>),
    ShowLayout(oneshot::Sender<Result<Layout>>),
    Splice(u64, u64, u64, oneshot::Sender<Result<()>>),
    FreezeLayout(oneshot::Sender<Result<()>>),
    Write(u64, Vec<u8>, oneshot::Sender<Result<()>>),
    Done(oneshot::Sender<Result<Vec<u8>>>),
}

struct Inner {
    writer: SegmentsWriter,
    buffer: ChunksBuffer,
    observer: Arc<dyn SinkObserver>,
    /// Set once `freeze_layout` (or `done`) has sealed the header; makes
    /// both idempotent against each other (spec §4.7: `freezeLayout` may
    /// run ahead of `done`, which must not then reseal).
    sealed_header: Option<Vec<u8>>,
    /// Highest content offset covered by any `write` so far, packed or
    /// not; `done` finalizes an as-yet-undefined size from this (spec
    /// §4.7: `setContentLength(biggestContentOfs)`).
    highest_write_end: u64,
}

impl Inner {
    async fn write(&mut self, ofs: u64, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.buffer.ensure_no_overlap(ofs, &bytes)?;
        self.highest_write_end = self.highest_write_end.max(ofs + bytes.len() as u64);
        self.buffer.insert(ofs, bytes);
        self.pack_whole_segments_from(ofs).await
    }

    async fn pack_whole_segments_from(&mut self, from_ofs: u64) -> Result<()> {
        let (start_chain, start_seg, _) = self.writer.locate_content_ofs(from_ofs)?;

        for edge in self.writer.unpacked_reencrypt_chain_segs() {
            if edge.0 < start_chain {
                self.pack_one(edge, &[]).await?;
            }
        }

        let infos: Vec<_> = self
            .writer
            .segment_infos(Some((start_chain, start_seg)))
            .collect::<Result<Vec<_>>>()?;

        for info in infos {
            match info.kind {
                WritableKind::Base { .. } => continue,
                WritableKind::New { need_packing, .. } => {
                    if !need_packing {
                        continue;
                    }
                    let Some(content) = self.buffer.try_extract(info.content_ofs, info.content_len) else {
                        break;
                    };
                    self.pack_one((info.chain, info.seg), &content).await?;
                }
            }
        }
        Ok(())
    }

    async fn pack_one(&mut self, seg_id: (usize, u32), content: &[u8]) -> Result<()> {
        let ciphertext = self.writer.pack_seg(content, seg_id)?;
        let seg_info = SegmentInfo {
            chain: seg_id.0,
            seg: seg_id.1,
            content_ofs: 0,
            content_len: 0,
            packed_ofs: 0,
            packed_len: ciphertext.len() as u64,
            endless_chain: false,
        };
        self.observer
            .on_event(SinkEvent::Seg {
                seg_id,
                ciphertext: Arc::new(ciphertext),
                seg_info,
            })
            .await
    }

    /// Seals the header if it isn't already (spec §4.7 `freezeLayout`).
    /// Idempotent: a caller-driven `freeze_layout` ahead of `done` is the
    /// expected way a "header" event can precede the last "seg" event
    /// (spec §5's ordering note).
    async fn freeze_layout(&mut self) -> Result<Vec<u8>> {
        if let Some(sealed) = &self.sealed_header {
            return Ok(sealed.clone());
        }
        for edge in self.writer.unpacked_reencrypt_chain_segs() {
            self.pack_one(edge, &[]).await?;
        }
        let layout = self.writer.show_packed_layout();
        let sealed = self.writer.pack_header()?;
        self.observer
            .on_event(SinkEvent::Header {
                sealed: Arc::new(sealed.clone()),
                layout,
            })
            .await?;
        self.sealed_header = Some(sealed.clone());
        Ok(sealed)
    }

    async fn done(&mut self) -> Result<Vec<u8>> {
        if self.writer.content_length().is_none() {
            let biggest = self.highest_write_end;
            self.writer.set_content_length(Some(biggest))?;
            if biggest > 0 {
                self.pack_whole_segments_from(0).await?;
            }
        }
        self.freeze_layout().await
    }

    fn get_size(&self) -> (Option<u64>, bool) {
        (self.writer.content_length(), self.writer.is_endless())
    }

    fn show_layout(&self) -> Layout {
        self.writer.show_packed_layout()
    }
}

/// Drives a [`SegmentsWriter`] from out-of-order plaintext writes. All
/// calls serialize through a single background task; concurrent calls
/// queue rather than race the writer.
pub struct EncryptingByteSink {
    tx: mpsc::Sender<Command>,
}

impl EncryptingByteSink {
    pub fn new(writer: SegmentsWriter, observer: Arc<dyn SinkObserver>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let mut inner = Inner {
            writer,
            buffer: ChunksBuffer::default(),
            observer,
            sealed_header: None,
            highest_write_end: 0,
        };
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::SetContentLength(len, reply) => {
                        let _ = reply.send(inner.writer.set_content_length(len));
                    }
                    Command::GetSize(reply) => {
                        let _ = reply.send(Ok(inner.get_size()));
                    }
                    Command::ShowLayout(reply) => {
                        let _ = reply.send(Ok(inner.show_layout()));
                    }
                    Command::Splice(pos, del, ins, reply) => {
                        if inner.sealed_header.is_some() {
                            let _ = reply.send(Err(XspError::HeaderPacked));
                        } else {
                            let _ = reply.send(inner.writer.splice(pos, del, ins));
                        }
                    }
                    Command::FreezeLayout(reply) => {
                        let _ = reply.send(inner.freeze_layout().await.map(|_| ()));
                    }
                    Command::Write(ofs, bytes, reply) => {
                        let _ = reply.send(inner.write(ofs, bytes).await);
                    }
                    Command::Done(reply) => {
                        let _ = reply.send(inner.done().await);
                        break;
                    }
                }
            }
        });
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| XspError::ArgsOutOfBounds("sink actor has already shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| XspError::ArgsOutOfBounds("sink actor dropped its reply".into()))?
    }

    pub async fn set_content_length(&self, len: Option<u64>) -> Result<()> {
        self.call(|r| Command::SetContentLength(len, r)).await
    }

    /// Returns `(content_length, is_endless)`.
    pub async fn get_size(&self) -> Result<(Option<u64>, bool)> {
        self.call(Command::GetSize).await
    }

    pub async fn show_layout(&self) -> Result<Layout> {
        self.call(Command::ShowLayout).await
    }

    pub async fn splice(&self, pos: u64, del: u64, ins: u64) -> Result<()> {
        self.call(|r| Command::Splice(pos, del, ins, r)).await
    }

    /// Force-packs any still-unpacked `headBytes` edge segments and seals
    /// the header now, ahead of `done`. Idempotent with a later `done`
    /// (spec §4.7): repeating this, or following it with `done`, replays
    /// the same sealed bytes rather than re-sealing.
    pub async fn freeze_layout(&self) -> Result<()> {
        self.call(Command::FreezeLayout).await
    }

    /// Writes `bytes` at content offset `ofs`. Writes must not overlap one
    /// another; they may arrive in any order.
    pub async fn write(&self, ofs: u64, bytes: Vec<u8>) -> Result<()> {
        self.call(|r| Command::Write(ofs, bytes, r)).await
    }

    /// Finishes the object: force-packs any still-unpacked `headBytes`
    /// edge segments, seals the header, and returns it.
    pub async fn done(self) -> Result<Vec<u8>> {
        self.call(Command::Done).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptor::{Cryptor as _, OsRng, XChaChaCryptor};
    use crate::key::SegKey;
    use std::sync::Mutex;

    struct CollectingObserver {
        segs: Mutex<Vec<(usize, u32)>>,
    }

    impl SinkObserver for CollectingObserver {
        fn on_event(&self, event: SinkEvent) -> BoxFuture<'static, Result<()>> {
            if let SinkEvent::Seg { seg_id, .. } = event {
                self.segs.lock().unwrap().push(seg_id);
            }
            Box::pin(async { Ok(()) })
        }
    }

    fn writer() -> SegmentsWriter {
        SegmentsWriter::new(
            SegKey::new([8u8; 32]),
            [2u8; 24],
            1, // 256-byte segments
            0,
            0,
            Arc::new(OsRng),
            Arc::new(XChaChaCryptor::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn out_of_order_whole_segment_writes_pack_in_segment_order() {
        let observer = Arc::new(CollectingObserver { segs: Mutex::new(Vec::new()) });
        let sink = EncryptingByteSink::new(writer(), observer.clone());
        sink.set_content_length(Some(512)).await.unwrap();

        sink.write(256, vec![2u8; 256]).await.unwrap();
        sink.write(0, vec![1u8; 256]).await.unwrap();

        let sealed = sink.done().await.unwrap();
        assert!(!sealed.is_empty());
        assert_eq!(observer.segs.lock().unwrap().as_slice(), &[(0, 0), (0, 1)]);
    }

    #[tokio::test]
    async fn overlapping_writes_are_rejected() {
        let observer = Arc::new(CollectingObserver { segs: Mutex::new(Vec::new()) });
        let sink = EncryptingByteSink::new(writer(), observer);
        sink.set_content_length(Some(512)).await.unwrap();

        sink.write(0, vec![1u8; 256]).await.unwrap();
        let err = sink.write(100, vec![2u8; 50]).await.unwrap_err();
        assert!(matches!(err, XspError::ArgsOutOfBounds(_)));
    }

    #[tokio::test]
    async fn freeze_layout_seals_header_ahead_of_done_and_is_idempotent() {
        let observer = Arc::new(CollectingObserver { segs: Mutex::new(Vec::new()) });
        let sink = EncryptingByteSink::new(writer(), observer.clone());
        sink.set_content_length(Some(256)).await.unwrap();
        sink.write(0, vec![1u8; 256]).await.unwrap();

        sink.freeze_layout().await.unwrap();
        let (len, endless) = sink.get_size().await.unwrap();
        assert_eq!(len, Some(256));
        assert!(!endless);

        let layout = sink.show_layout().await.unwrap();
        assert!(!layout.sections.is_empty());

        // splice after the header is sealed is no longer allowed
        let err = sink.splice(0, 1, 1).await.unwrap_err();
        assert!(matches!(err, XspError::HeaderPacked));

        // done() replays the same sealed bytes rather than re-sealing
        let sealed = sink.done().await.unwrap();
        assert!(!sealed.is_empty());
    }

    #[tokio::test]
    async fn done_finalizes_size_from_writes_when_never_set() {
        let observer = Arc::new(CollectingObserver { segs: Mutex::new(Vec::new()) });
        let sink = EncryptingByteSink::new(writer(), observer.clone());
        // content length left undefined (writer starts endless)

        sink.write(0, vec![1u8; 100]).await.unwrap();
        let sealed = sink.done().await.unwrap();
        assert!(!sealed.is_empty());

        let (len, endless) = {
            let cryptor = XChaChaCryptor::new();
            let plain = cryptor
                .format_wn_open(&sealed, &SegKey::new([8u8; 32]))
                .unwrap();
            let info = crate::header::decode_header(&plain).unwrap();
            let chain = &info.seg_chains[0];
            (chain.last_seg_size(256), chain.num_of_segs().is_none())
        };
        assert_eq!(len, 100);
        assert!(!endless);
    }

    #[tokio::test]
    async fn partial_segment_writes_buffer_until_whole() {
        let observer = Arc::new(CollectingObserver { segs: Mutex::new(Vec::new()) });
        let sink = EncryptingByteSink::new(writer(), observer.clone());
        sink.set_content_length(Some(256)).await.unwrap();

        sink.write(0, vec![1u8; 100]).await.unwrap();
        assert!(observer.segs.lock().unwrap().is_empty());
        sink.write(100, vec![1u8; 156]).await.unwrap();
        assert_eq!(observer.segs.lock().unwrap().as_slice(), &[(0, 0)]);

        sink.done().await.unwrap();
    }
}

//! Chunked upload driver shared by the block/part based providers.
//!
//! A provider implements [`ChunkSink`] (start a session, stage one chunk,
//! commit the ordered list, abort). [`upload_chunked`] splits the file into
//! fixed-size chunks, retries individual chunks on transient failures and
//! commits them in upload order. Every call starts a new session and sends
//! every chunk; nothing staged by an earlier call is reused.

use crate::{OffloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Delay before retrying a chunk, multiplied by the attempt number.
const CHUNK_RETRY_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Zero-based position in upload order
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

/// Fixed-size split of a file.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub total: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn new(total: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let count = total.div_ceil(chunk_size);
        let chunks = (0..count)
            .map(|i| {
                let offset = i * chunk_size;
                ChunkSpec {
                    index: i as u32,
                    offset,
                    len: chunk_size.min(total - offset),
                }
            })
            .collect();
        Self {
            total,
            chunk_size,
            chunks,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// What the provider returned for a staged chunk (block id, ETag, SHA-1...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub index: u32,
    pub id: String,
    pub size: u64,
}

#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Per-upload provider state (upload id, session URI, file id).
    type Session: Send + Sync;

    async fn begin(&self, total: u64) -> Result<Self::Session>;

    async fn put_chunk(&self, session: &Self::Session, chunk: ChunkSpec, data: Bytes) -> Result<ChunkReceipt>;

    /// Commit all chunks. `receipts` is in upload order.
    async fn commit(&self, session: &Self::Session, receipts: &[ChunkReceipt]) -> Result<()>;

    async fn abort(&self, _session: &Self::Session) -> Result<()> {
        Ok(())
    }
}

/// Upload `path` through `sink` in chunks of `chunk_size` bytes.
pub async fn upload_chunked<S>(sink: &S, path: &Path, chunk_size: u64, part_retries: u32) -> Result<()>
where
    S: ChunkSink + ?Sized,
{
    let total = tokio::fs::metadata(path).await?.len();
    let plan = ChunkPlan::new(total, chunk_size);
    let session = sink.begin(total).await?;

    match stage_and_commit(sink, &session, path, &plan, part_retries).await {
        Ok(()) => {
            info!(file = %path.display(), chunks = plan.len(), bytes = total, "Chunked upload committed");
            Ok(())
        }
        Err(e) => {
            if let Err(abort_err) = sink.abort(&session).await {
                warn!(file = %path.display(), error = %abort_err, "Failed to abort chunked upload");
            }
            Err(e)
        }
    }
}

async fn stage_and_commit<S>(
    sink: &S,
    session: &S::Session,
    path: &Path,
    plan: &ChunkPlan,
    part_retries: u32,
) -> Result<()>
where
    S: ChunkSink + ?Sized,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut receipts = Vec::with_capacity(plan.len());

    for chunk in &plan.chunks {
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        let mut buf = vec![0u8; chunk.len as usize];
        file.read_exact(&mut buf).await?;
        let data = Bytes::from(buf);

        let receipt = put_with_retries(sink, session, *chunk, data, part_retries).await?;
        debug!(index = chunk.index, id = %receipt.id, "Chunk staged");
        receipts.push(receipt);
    }

    sink.commit(session, &receipts).await
}

async fn put_with_retries<S>(
    sink: &S,
    session: &S::Session,
    chunk: ChunkSpec,
    data: Bytes,
    part_retries: u32,
) -> Result<ChunkReceipt>
where
    S: ChunkSink + ?Sized,
{
    let attempts = part_retries.max(1);
    let mut last_err: Option<OffloadError> = None;

    for attempt in 1..=attempts {
        match sink.put_chunk(session, chunk, data.clone()).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(index = chunk.index, attempt, error = %e, "Chunk upload failed, retrying");
                tokio::time::sleep(Duration::from_millis(CHUNK_RETRY_DELAY_MS * u64::from(attempt))).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| OffloadError::Transport("chunk upload retries exhausted".into())))
}

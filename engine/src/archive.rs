//! Streams many resources into one ZIP archive as they become available.
//!
//! Each item runs the cache-aware fetch pipeline in its own task, with a semaphore
//! bounding how many run at once. Entries are appended in completion order, so the
//! archive never waits on a slow item while faster ones are ready. Output leaves through
//! a bounded channel and is never held in memory as a whole.
//!
//! A failed item or an expired job deadline ends the stream with an error before the
//! central directory is written. Consumers therefore always see a truncated archive
//! followed by an error, never a valid-looking partial one.

use crate::errors::{EngineError, Result};
use crate::metrics_defs::{ARCHIVE_ABORTED, ARCHIVE_ENTRIES, ARCHIVE_IN_FLIGHT};
use crate::pipeline::{ContentService, FetchedResource};
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::{Bytes, BytesMut};
use shared::{counter, gauge};
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};
use tokio_util::sync::PollSender;

/// Bytes accumulated before a chunk is handed to the consumer.
const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered between the driver and a slow consumer.
const CHANNEL_CAPACITY: usize = 8;
const MAX_NAME_LEN: usize = 180;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveItem {
    pub scope: String,
    pub resource_id: String,
    pub display_name: String,
    pub preferred_client: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ArchiveJob {
    pub items: Vec<ArchiveItem>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArchiveLimits {
    pub max_items: usize,
    pub max_in_flight: usize,
    pub job_timeout: Duration,
}

type Chunk = Result<Bytes>;

pub struct ArchiveAssembler {
    service: Arc<ContentService>,
    limits: ArchiveLimits,
}

impl ArchiveAssembler {
    pub fn new(service: Arc<ContentService>, limits: ArchiveLimits) -> Self {
        ArchiveAssembler { service, limits }
    }

    pub fn limits(&self) -> ArchiveLimits {
        self.limits
    }

    /// Validates `job` and starts assembling it in the background.
    ///
    /// Validation errors are returned before any I/O happens. Everything after that is
    /// reported through the returned stream.
    pub fn assemble(&self, job: ArchiveJob) -> Result<ArchiveStream> {
        let count = job.items.len();
        if count == 0 {
            return Err(EngineError::NoItems);
        }
        if count > self.limits.max_items {
            return Err(EngineError::TooManyItems {
                count,
                max: self.limits.max_items,
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(drive(self.service.clone(), self.limits, job.items, tx));

        Ok(ArchiveStream { rx })
    }
}

/// Receiving end of an archive being assembled.
///
/// Yields `Ok` chunks until the archive is complete, or a single `Err` after which the
/// archive must be treated as broken.
pub struct ArchiveStream {
    rx: mpsc::Receiver<Chunk>,
}

impl ArchiveStream {
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    pub fn poll_next_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        self.rx.poll_recv(cx)
    }
}

async fn drive(service: Arc<ContentService>, limits: ArchiveLimits, items: Vec<ArchiveItem>, tx: mpsc::Sender<Chunk>) {
    let item_count = items.len();
    let error_tx = tx.clone();
    let sink = ArchiveSink::new(tx);

    let result = match timeout(limits.job_timeout, write_archive(service, limits, items, sink)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ArchiveTimeout(limits.job_timeout)),
    };

    match result {
        Ok(()) => tracing::debug!(items = item_count, "Archive complete"),
        Err(error) => {
            let reason = match &error {
                EngineError::ArchiveTimeout(_) => "timeout",
                EngineError::ArchiveAborted { .. } => "item_failed",
                _ => "write_failed",
            };
            counter!(ARCHIVE_ABORTED, "reason" => reason).increment(1);
            tracing::warn!(items = item_count, %error, "Archive aborted");

            // Fails only if the consumer is already gone
            let _ = error_tx.send(Err(error)).await;
        }
    }
}

async fn write_archive(
    service: Arc<ContentService>,
    limits: ArchiveLimits,
    items: Vec<ArchiveItem>,
    sink: ArchiveSink,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(limits.max_in_flight.max(1)));
    let mut join_set = JoinSet::new();

    for item in items {
        let service = service.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (item, Err(EngineError::ArchiveWrite(e.to_string())), None),
            };
            gauge!(ARCHIVE_IN_FLIGHT).increment(1.0);
            let result = service
                .fetch_with_retries(&item.scope, &item.resource_id, item.preferred_client.as_deref())
                .await;
            (item, result, Some(InFlight { _permit: permit }))
        });
    }

    // Returning early drops `join_set`, which aborts every pipeline still running
    let mut writer = ZipFileWriter::with_tokio(sink);
    let mut names = EntryNames::default();

    while let Some(joined) = join_set.join_next().await {
        // The permit stays held until the entry is written, so fetched payloads waiting
        // on a slow consumer count against `max_in_flight`
        let (item, result, _in_flight) = joined.map_err(|e| EngineError::ArchiveWrite(e.to_string()))?;
        let resource: FetchedResource = result.map_err(|source| EngineError::ArchiveAborted {
            scope: item.scope.clone(),
            resource_id: item.resource_id.clone(),
            source: Box::new(source),
        })?;

        let name = names.claim(&item.display_name, &item.resource_id, &resource.extension);
        let entry = ZipEntryBuilder::new(name.clone().into(), Compression::Deflate);
        writer
            .write_entry_whole(entry, &resource.bytes)
            .await
            .map_err(|e| EngineError::ArchiveWrite(e.to_string()))?;

        counter!(ARCHIVE_ENTRIES).increment(1);
        tracing::debug!(scope = item.scope, resource_id = item.resource_id, name, "Archive entry written");
    }

    let mut sink = writer
        .close()
        .await
        .map_err(|e| EngineError::ArchiveWrite(e.to_string()))?
        .into_inner();
    sink.shutdown()
        .await
        .map_err(|e| EngineError::ArchiveWrite(e.to_string()))
}

/// Semaphore permit of a pipeline whose payload has not been written yet.
struct InFlight {
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        gauge!(ARCHIVE_IN_FLIGHT).decrement(1.0);
    }
}

/// Hands out unique entry names: `<sanitized display name>.<extension>`, then `_2`,
/// `_3`, ... for repeats.
#[derive(Default)]
struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    fn claim(&mut self, display_name: &str, fallback: &str, extension: &str) -> String {
        let mut base = sanitize(display_name);
        if base.is_empty() {
            base = sanitize(fallback);
        }
        if base.is_empty() {
            base = "file".to_string();
        }

        // Don't double the extension when the caller already included it
        let suffix = format!(".{extension}");
        if base.len() > suffix.len() && base.to_ascii_lowercase().ends_with(&suffix) {
            base.truncate(base.len() - suffix.len());
        }

        let mut candidate = format!("{base}{suffix}");
        let mut n = 2;
        while !self.taken.insert(candidate.to_ascii_lowercase()) {
            candidate = format!("{base}_{n}{suffix}");
            n += 1;
        }
        candidate
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_NAME_LEN)
        .collect();
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

/// `AsyncWrite` over the archive channel.
///
/// Writes are buffered into chunks of at most `CHUNK_SIZE`. A full channel suspends the writer,
/// which is how a slow consumer throttles the whole job. A dropped consumer turns every
/// further write into `BrokenPipe`.
pub struct ArchiveSink {
    sender: PollSender<Chunk>,
    buffer: BytesMut,
}

impl ArchiveSink {
    pub fn new(sender: mpsc::Sender<Chunk>) -> Self {
        ArchiveSink {
            sender: PollSender::new(sender),
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn poll_send_buffer(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| consumer_gone())?;
        let chunk = self.buffer.split().freeze();
        self.sender.send_item(Ok(chunk)).map_err(|_| consumer_gone())?;
        Poll::Ready(Ok(()))
    }
}

fn consumer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away")
}

impl AsyncWrite for ArchiveSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.buffer.len() >= CHUNK_SIZE {
            ready!(this.poll_send_buffer(cx))?;
        }
        // Short writes keep every chunk at most `CHUNK_SIZE`
        let accepted = buf.len().min(CHUNK_SIZE - this.buffer.len());
        this.buffer.extend_from_slice(&buf[..accepted]);
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send_buffer(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_buffer(cx))?;
        this.sender.close();
        Poll::Ready(Ok(()))
    }
}

//! Dedicated writer task for the backend connection.
//!
//! Every caller shares one outbound socket. Instead of locking the write
//! half, callers hand encoded messages to a writer task over an mpsc
//! channel; the task batches whatever is queued into vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► TCP
//! Caller N ─┘
//! ```
//!
//! Because the task is the only writer, the parts of one multipart message
//! are never interleaved with another caller's parts.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::protocol::{ByteOrder, Frame};
use crate::transport::encode_message;

/// Default maximum pending messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A multipart message ready to be written, as wire segments.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    segments: Vec<Bytes>,
}

impl OutboundMessage {
    /// Encode message parts.
    pub fn from_parts(parts: &[Bytes]) -> Self {
        Self {
            segments: encode_message(parts),
        }
    }

    /// Encode a frame's envelope.
    pub fn from_frame(frame: &Frame, order: ByteOrder) -> Self {
        Self::from_parts(&frame.to_parts(order))
    }

    /// Total bytes this message occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    #[inline]
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending messages before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Queue depth shared by the handles and the writer task.
#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    drained: Notify,
}

/// Handle for sending messages to the writer task.
///
/// Cheap to clone; every dispatcher shares the same handle.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    queue: Arc<QueueState>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a message, waiting while backpressure is active.
    ///
    /// Fails with `BackpressureTimeout` when the queue does not drain below
    /// the limit in time and with `ConnectionClosed` once the writer exited.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.wait_for_room().await?;
        self.queue.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).await.map_err(|_| {
            self.queue.pending.fetch_sub(1, Ordering::AcqRel);
            GatewayError::ConnectionClosed
        })
    }

    async fn wait_for_room(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            // Registered before the check so a drain in between is not lost.
            let drained = self.queue.drained.notified();
            if !self.is_backpressure_active() {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(GatewayError::ConnectionClosed);
            }
            tokio::time::timeout_at(deadline, drained)
                .await
                .map_err(|_| GatewayError::BackpressureTimeout)?;
        }
    }

    /// Whether senders currently have to wait.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    /// Messages queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.queue.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending messages.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let queue = Arc::new(QueueState::default());

    let handle = WriterHandle {
        tx,
        queue: Arc::clone(&queue),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, queue));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
    queue: Arc<QueueState>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        if rx.recv_many(&mut batch, MAX_BATCH_SIZE).await == 0 {
            // every handle dropped
            let _ = writer.shutdown().await;
            return Ok(());
        }

        let written = write_batch(&mut writer, &batch).await;
        queue.pending.fetch_sub(batch.len(), Ordering::AcqRel);
        queue.drained.notify_waiters();
        batch.clear();

        if let Err(e) = written {
            tracing::error!("Backend write failed: {}", e);
            rx.close();
            queue.drained.notify_waiters();
            return Err(e);
        }
    }
}

/// Write a batch of messages with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundMessage::size).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundMessage], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::new();
    let mut offset = 0;

    for segment in batch.iter().flat_map(|m| m.segments.iter()) {
        let end = offset + segment.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&segment[start..]));
        }
        offset = end;
    }

    slices
}

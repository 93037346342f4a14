//! Dedicated writer task for outgoing commands.
//!
//! Requests, events and operation replies are framed by the sending
//! [`WriterHandle`] and handed to a single task over an mpsc channel. The
//! task batches whatever is ready into one vectored write, so frames of
//! different senders never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! send_command ─┐
//! reply 1      ─┼─► WriterHandle::send ─► frame ─► mpsc ─► Writer Task ─► socket
//! event N      ─┘
//! ```
//!
//! Backpressure: the handle counts frames not yet written. Once the limit is
//! reached senders wait for the task to drain a batch, up to a timeout.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command::OutgoingCommand;
use crate::error::{AggError, Result};
use crate::metrics::ProtocolMetrics;
use crate::protocol::FrameEncoder;

pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames drained per vectored write.
const MAX_BATCH_FRAMES: usize = 64;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames accepted but not yet written before senders have to wait.
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    /// How long a sender waits for the backlog to shrink.
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

/// Backlog shared by every handle and the writer task.
#[derive(Debug, Default)]
struct Backlog {
    frames: AtomicUsize,
    drained: Notify,
}

/// Sending side of the writer task.
///
/// Cheaply cloneable; shared by the connection and every operation context.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    encoder: FrameEncoder,
    backlog: Arc<Backlog>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Frame `command` and queue it for writing.
    ///
    /// Waits while the backlog is full, failing with
    /// [`AggError::BackpressureTimeout`] after the configured duration.
    pub async fn send(&self, command: OutgoingCommand) -> Result<()> {
        let frame = self.encoder.encode(command.content())?;
        self.send_frame(frame).await
    }

    /// Queue an already framed command.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_drain().await?;
        }

        // Count before sending so the task can never underflow.
        self.backlog.frames.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.backlog.frames.fetch_sub(1, Ordering::AcqRel);
            AggError::ConnectionClosed
        })
    }

    async fn wait_for_drain(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let drained = self.backlog.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if !self.is_backpressure_active() {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(AggError::ConnectionClosed);
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return Err(AggError::BackpressureTimeout);
            }
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backlog.frames.load(Ordering::Acquire)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle that frames with `encoder`.
///
/// The returned `JoinHandle` resolves when every handle is dropped or a
/// write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    encoder: FrameEncoder,
    config: WriterConfig,
    metrics: Arc<ProtocolMetrics>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backlog = Arc::new(Backlog::default());

    let handle = WriterHandle {
        tx,
        encoder,
        backlog: backlog.clone(),
        max_pending: config.max_pending_frames.max(1),
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(async move {
        let result = write_loop(rx, writer, &backlog, metrics).await;
        // Wake senders parked on a backlog that will never drain.
        backlog.drained.notify_waiters();
        if let Err(e) = &result {
            tracing::debug!("Writer task stopped: {}", e);
        }
        result
    });

    (handle, task)
}

async fn write_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    backlog: &Backlog,
    metrics: Arc<ProtocolMetrics>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_FRAMES);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_FRAMES {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;

        backlog.frames.fetch_sub(batch.len(), Ordering::AcqRel);
        backlog.drained.notify_waiters();
        metrics.record_frames_written(batch.len());
        batch.clear();
    }

    // All handles dropped.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(AggError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering what is left of `batch` after `skip` bytes.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;
    for frame in batch {
        let end = offset + frame.len();
        if skip < end {
            slices.push(IoSlice::new(&frame[skip.saturating_sub(offset)..]));
        }
        offset = end;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, EncodeLimits};
    use crate::config::ProtocolVersion;
    use crate::protocol::FrameDecoder;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn spawn_v3<W>(writer: W, metrics: Arc<ProtocolMetrics>) -> (WriterHandle, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        spawn_writer_task(
            writer,
            FrameEncoder::new(ProtocolVersion::V3),
            WriterConfig::default(),
            metrics,
        )
    }

    fn ok_reply(id: usize) -> OutgoingCommand {
        OutgoingCommand::reply_ok(&id.to_string(), None, EncodeLimits::default()).unwrap()
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_commands_arrive_framed_and_in_order() {
        let (client, mut server) = duplex(4096);
        let metrics = Arc::new(ProtocolMetrics::new());
        let (handle, _task) = spawn_v3(client, metrics.clone());

        for id in 0..10 {
            handle.send(ok_reply(id)).await.unwrap();
        }

        let mut decoder = FrameDecoder::with_defaults(ProtocolVersion::V3);
        let mut commands: Vec<Command> = Vec::new();
        let mut buf = vec![0u8; 1024];
        while commands.len() < 10 {
            let n = server.read(&mut buf).await.unwrap();
            commands.extend(decoder.push(&buf[..n]).unwrap());
        }
        let ids: Vec<_> = commands.iter().map(|c| c.id().unwrap().to_string()).collect();
        assert_eq!(ids, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());

        for _ in 0..100 {
            if metrics.snapshot().frames_written == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(metrics.snapshot().frames_written, 10);
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_backlog_times_out() {
        // Nobody reads the other end, so the second frame never drains.
        let (client, _server) = duplex(8);
        let (handle, _task) = spawn_writer_task(
            client,
            FrameEncoder::new(ProtocolVersion::V3),
            WriterConfig {
                max_pending_frames: 1,
                channel_capacity: 4,
                backpressure_timeout: Duration::from_millis(50),
            },
            Arc::new(ProtocolMetrics::new()),
        );

        handle.send(ok_reply(1)).await.unwrap();
        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.send(ok_reply(2)).await,
            Err(AggError::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_full_backlog_clears_when_drained() {
        let (client, mut server) = duplex(64);
        let (handle, _task) = spawn_writer_task(
            client,
            FrameEncoder::new(ProtocolVersion::V3),
            WriterConfig {
                max_pending_frames: 1,
                channel_capacity: 4,
                backpressure_timeout: Duration::from_secs(5),
            },
            Arc::new(ProtocolMetrics::new()),
        );

        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::with_defaults(ProtocolVersion::V3);
            let mut buf = vec![0u8; 1024];
            let mut received = 0;
            while received < 2 {
                let n = server.read(&mut buf).await.unwrap();
                assert!(n > 0, "writer closed early");
                received += decoder.push(&buf[..n]).unwrap().len();
            }
        });

        handle.send(ok_reply(1)).await.unwrap();
        handle.send(ok_reply(2)).await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_v3(client, Arc::new(ProtocolMetrics::new()));

        // The first write fails and stops the task.
        let _ = handle.send(ok_reply(1)).await;
        assert!(task.await.unwrap().is_err());
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(ok_reply(2)).await,
            Err(AggError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_remaining_slices() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world!")];

        assert_eq!(remaining_slices(&batch, 0).len(), 2);

        let partial = remaining_slices(&batch, 3);
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0].len(), 2);

        let second_only = remaining_slices(&batch, 7);
        assert_eq!(second_only.len(), 1);
        assert_eq!(second_only[0].len(), 4);
    }

    #[tokio::test]
    async fn test_write_batch_concatenates() {
        let mut out = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut out, &batch).await.unwrap();
        assert_eq!(out.into_inner(), b"abcabcabcabcabc");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_v3(client, Arc::new(ProtocolMetrics::new()));

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}

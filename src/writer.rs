//! Dedicated writer task per connection.
//!
//! All senders funnel frames through an mpsc channel into one task that
//! owns the write half of the stream. Each frame is queued as a single
//! contiguous buffer and written in full before the next one starts, so
//! concurrent senders can never interleave bytes on the wire.
//!
//! ```text
//! Sender 1 ─┐
//! Sender 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► TLS stream
//! Hub relay ─┘
//! ```
//!
//! The channel is bounded: `send` waits for space (local senders observe
//! backpressure), `try_send` fails immediately with `QueueOverflow` (the
//! forwarding path decides per-operand whether to drop the frame or close
//! the slow peer).

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Result, SsntpError};

/// Default outbound queue depth per connection.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Handle for queueing frames to a connection's writer task.
///
/// Cheaply cloneable; shared by the local send API and the hub's
/// forwarding engine.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a frame, waiting for space when the queue is full.
    ///
    /// Fails with `ConnectionFailure` once the writer task has exited.
    pub(crate) async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SsntpError::ConnectionFailure)
    }

    /// Queue a frame without waiting.
    ///
    /// Fails with `QueueOverflow` when the queue is full and with
    /// `ConnectionFailure` once the writer task has exited.
    pub(crate) fn try_send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SsntpError::QueueOverflow,
            mpsc::error::TrySendError::Closed(_) => SsntpError::ConnectionFailure,
        })
    }
}

/// Spawn the writer task over the write half of a connection.
///
/// The task exits when the shutdown signal fires (draining frames already
/// queued), when all handles are dropped, or on a write error or missed
/// write deadline.
pub(crate) fn spawn_writer<W>(
    writer: W,
    shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
    queue_depth: usize,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(queue_depth);
    let task = tokio::spawn(writer_loop(rx, writer, shutdown, write_timeout));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                // All handles dropped, clean shutdown.
                None => return Ok(()),
            },
            _ = shutdown.changed() => {
                return drain(&mut rx, &mut writer, write_timeout).await;
            }
        };

        write_frame(&mut writer, frame, write_timeout).await?;
    }
}

/// Flush frames already queued at shutdown, each under its own deadline.
async fn drain<W>(
    rx: &mut mpsc::Receiver<Bytes>,
    writer: &mut W,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(frame) = rx.try_recv() {
        write_frame(writer, frame, write_timeout).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: Bytes, write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let io = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    };

    match timeout(write_timeout, io).await {
        Ok(result) => result.map_err(SsntpError::Io),
        Err(_) => Err(SsntpError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_send_reaches_the_wire() {
        let (local, mut remote) = duplex(4096);
        let (_tx, rx) = shutdown_pair();
        let (handle, _task) = spawn_writer(local, rx, Duration::from_secs(1), 16);

        handle.send(Bytes::from_static(b"frame-bytes")).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-bytes");
    }

    #[tokio::test]
    async fn test_frames_are_written_whole_and_in_order() {
        let (local, mut remote) = duplex(4096);
        let (_tx, rx) = shutdown_pair();
        let (handle, _task) = spawn_writer(local, rx, Duration::from_secs(1), 16);

        for i in 0u8..10 {
            handle.send(Bytes::from(vec![i; 8])).await.unwrap();
        }

        let mut buf = vec![0u8; 80];
        remote.read_exact(&mut buf).await.unwrap();
        for i in 0u8..10 {
            assert_eq!(&buf[i as usize * 8..(i as usize + 1) * 8], &[i; 8]);
        }
    }

    #[tokio::test]
    async fn test_try_send_overflow() {
        // A tiny duplex buffer that nobody reads: the writer task blocks on
        // the first frame and the queue fills up.
        let (local, _remote) = duplex(1);
        let (_tx, rx) = shutdown_pair();
        let (handle, _task) = spawn_writer(local, rx, Duration::from_secs(5), 2);

        let frame = Bytes::from(vec![0u8; 1024]);
        // First frame moves into the writer, the queue holds two more.
        handle.try_send(frame.clone()).unwrap();
        handle.try_send(frame.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.try_send(frame.clone()).unwrap();

        let result = handle.try_send(frame);
        assert!(matches!(result, Err(SsntpError::QueueOverflow)));
    }

    #[tokio::test]
    async fn test_handle_fails_after_task_exit() {
        let (local, _remote) = duplex(4096);
        let (tx, rx) = shutdown_pair();
        let (handle, task) = spawn_writer(local, rx, Duration::from_secs(1), 16);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let result = handle.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(SsntpError::ConnectionFailure)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_frames() {
        let (local, mut remote) = duplex(4096);
        let (tx, rx) = shutdown_pair();
        let (handle, task) = spawn_writer(local, rx, Duration::from_secs(1), 16);

        handle.send(Bytes::from_static(b"first")).await.unwrap();
        handle.send(Bytes::from_static(b"second")).await.unwrap();
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"firstsecond");
    }
}

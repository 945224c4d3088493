//! Connection lifecycle primitives shared by clients and servers.
//!
//! A connection moves through Idle, Connecting, Connected, and Closed.
//! Transitions are serialized by [`StatusGuard`]; concurrent senders may
//! call into a connection but only one transition executes at a time, and
//! sends outside `Connected` fail synchronously.
//!
//! [`run_frame_pump`] is the single-threaded receive side: it reads from
//! the transport, feeds the frame buffer, and hands every decoded unit to
//! the dispatcher callback in arrival order, which preserves causal order
//! of received frames end to end. The read deadline is armed only while a
//! frame is partially received; an idle connection does not time out.

use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{Result, SsntpError};
use crate::protocol::{Decoded, FrameBuffer};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No transport yet.
    Idle,
    /// Transport established, handshake in progress.
    Connecting,
    /// Handshake complete; frames flow in both directions.
    Connected,
    /// Torn down; no further frames.
    Closed,
}

/// Serializes state transitions for one connection.
#[derive(Debug)]
pub(crate) struct StatusGuard {
    status: Mutex<ConnectionStatus>,
}

impl StatusGuard {
    pub(crate) fn new(initial: ConnectionStatus) -> Self {
        Self {
            status: Mutex::new(initial),
        }
    }

    pub(crate) fn current(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Move from `from` to `to`; fails when another transition got there
    /// first.
    pub(crate) fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        if *status != from {
            return Err(SsntpError::ConnectionFailure);
        }
        *status = to;
        Ok(())
    }

    /// Close the connection. Idempotent; returns whether this call did the
    /// closing, so teardown work runs exactly once.
    pub(crate) fn close(&self) -> bool {
        let mut status = self.status.lock().unwrap();
        let was_open = *status != ConnectionStatus::Closed;
        *status = ConnectionStatus::Closed;
        was_open
    }

    /// Fail unless the connection is established.
    pub(crate) fn ensure_connected(&self) -> Result<()> {
        match self.current() {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(SsntpError::ConnectionFailure),
        }
    }
}

/// Why the frame pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// The peer closed the stream.
    Eof,
    /// Local shutdown was signalled.
    Shutdown,
    /// The dispatcher asked to stop (e.g. the peer aborted).
    Stopped,
}

/// The handshake frame plus whatever the peer pipelined behind it: frames
/// already decoded and the buffer holding any partial tail. Both are
/// handed to [`run_frame_pump`] so no byte is lost across the handshake
/// boundary.
pub(crate) struct HandshakeRead {
    /// The first decoded unit on the connection.
    pub first: Decoded,
    /// Frames decoded from the same reads, in arrival order.
    pub pending: Vec<Decoded>,
    /// The frame buffer, possibly holding a partial frame.
    pub frames: FrameBuffer,
}

/// Read the first decoded unit, under an overall deadline. Used for the
/// handshake, where exactly one inbound frame is legal.
pub(crate) async fn read_one_frame<R>(reader: &mut R, deadline: Duration) -> Result<HandshakeRead>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 4 * 1024];

    let result = timeout(deadline, async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(SsntpError::ConnectionFailure);
            }
            let mut decoded = frames.push(&buf[..n])?.into_iter();
            if let Some(first) = decoded.next() {
                return Ok((first, decoded.collect::<Vec<_>>()));
            }
        }
    })
    .await;

    match result {
        Ok(Ok((first, pending))) => Ok(HandshakeRead {
            first,
            pending,
            frames,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SsntpError::Timeout),
    }
}

/// Run the receive side of an established connection.
///
/// `on_decoded` is invoked for every decoded unit; returning `Ok(false)`
/// stops the pump. Any error from the callback or the decoder tears the
/// pump down and is surfaced to the caller.
pub(crate) async fn run_frame_pump<R, F>(
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
    carry: Option<(Vec<Decoded>, FrameBuffer)>,
    mut on_decoded: F,
) -> Result<PumpEnd>
where
    R: AsyncRead + Unpin,
    F: FnMut(Decoded) -> Result<bool>,
{
    let (pending, mut frames) = carry.unwrap_or_else(|| (Vec::new(), FrameBuffer::new()));
    for decoded in pending {
        if !on_decoded(decoded)? {
            return Ok(PumpEnd::Stopped);
        }
    }

    let mut buf = vec![0u8; 16 * 1024];

    loop {
        if *shutdown.borrow() {
            return Ok(PumpEnd::Shutdown);
        }

        let n = if frames.has_partial() {
            // Mid-frame: the peer must keep the bytes coming.
            tokio::select! {
                _ = shutdown.changed() => return Ok(PumpEnd::Shutdown),
                read = timeout(read_timeout, reader.read(&mut buf)) => match read {
                    Ok(read) => read?,
                    Err(_) => return Err(SsntpError::Timeout),
                },
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => return Ok(PumpEnd::Shutdown),
                read = reader.read(&mut buf) => read?,
            }
        };

        if n == 0 {
            return Ok(PumpEnd::Eof);
        }

        for decoded in frames.push(&buf[..n])? {
            if !on_decoded(decoded)? {
                return Ok(PumpEnd::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Frame};
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_status_transitions() {
        let guard = StatusGuard::new(ConnectionStatus::Idle);
        assert_eq!(guard.current(), ConnectionStatus::Idle);

        guard
            .transition(ConnectionStatus::Idle, ConnectionStatus::Connecting)
            .unwrap();
        guard
            .transition(ConnectionStatus::Connecting, ConnectionStatus::Connected)
            .unwrap();
        assert!(guard.ensure_connected().is_ok());

        // A stale transition loses.
        let result = guard.transition(ConnectionStatus::Idle, ConnectionStatus::Connecting);
        assert!(matches!(result, Err(SsntpError::ConnectionFailure)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let guard = StatusGuard::new(ConnectionStatus::Connected);
        assert!(guard.close());
        assert!(!guard.close());
        assert!(matches!(
            guard.ensure_connected(),
            Err(SsntpError::ConnectionFailure)
        ));
    }

    #[tokio::test]
    async fn test_pump_delivers_frames_in_order() {
        let (mut local, remote) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let frames = vec![
            Frame::command(Command::Stats, Bytes::from_static(b"one")),
            Frame::command(Command::Stats, Bytes::from_static(b"two")),
        ];
        for frame in &frames {
            local.write_all(&frame.encode()).await.unwrap();
        }
        drop(local);

        let mut seen = Vec::new();
        let end = run_frame_pump(remote, shutdown_rx, Duration::from_secs(1), None, |decoded| {
            if let Decoded::Frame(frame) = decoded {
                seen.push(frame);
            }
            Ok(true)
        })
        .await
        .unwrap();

        assert_eq!(end, PumpEnd::Eof);
        assert_eq!(seen, frames);
    }

    #[tokio::test]
    async fn test_pump_stops_on_dispatcher_request() {
        let (mut local, remote) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let frame = Frame::command(Command::Stop, Bytes::new());
        local.write_all(&frame.encode()).await.unwrap();

        let end = run_frame_pump(remote, shutdown_rx, Duration::from_secs(1), None, |_| Ok(false))
            .await
            .unwrap();
        assert_eq!(end, PumpEnd::Stopped);
    }

    #[tokio::test]
    async fn test_pump_shutdown_signal() {
        let (_local, remote) = tokio::io::duplex(4096);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(run_frame_pump(
            remote,
            shutdown_rx,
            Duration::from_secs(1),
            None,
            |_| Ok(true),
        ));

        shutdown_tx.send(true).unwrap();
        let end = pump.await.unwrap().unwrap();
        assert_eq!(end, PumpEnd::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_mid_frame_deadline() {
        let (mut local, remote) = tokio::io::duplex(4096);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Half a frame, then silence.
        let frame = Frame::command(Command::Start, Bytes::from_static(b"workload"));
        let bytes = frame.encode();
        local.write_all(&bytes[..6]).await.unwrap();

        let result =
            run_frame_pump(remote, shutdown_rx, Duration::from_secs(30), None, |_| Ok(true)).await;
        assert!(matches!(result, Err(SsntpError::Timeout)));
    }

    #[tokio::test]
    async fn test_read_one_frame() {
        let (mut local, mut remote) = tokio::io::duplex(4096);
        let frame = Frame::connect(crate::role::Role::AGENT);
        local.write_all(&frame.encode()).await.unwrap();

        let read = read_one_frame(&mut remote, Duration::from_secs(1))
            .await
            .unwrap();
        match read.first {
            Decoded::Frame(got) => assert_eq!(got, frame),
            other => panic!("unexpected {:?}", other),
        }
        assert!(read.pending.is_empty());
        assert!(!read.frames.has_partial());
    }

    #[tokio::test]
    async fn test_read_one_frame_keeps_pipelined_tail() {
        let (mut local, mut remote) = tokio::io::duplex(4096);
        let first = Frame::connect(crate::role::Role::AGENT);
        let second = Frame::command(Command::Stats, Bytes::from_static(b"early"));

        let mut bytes = first.encode().to_vec();
        bytes.extend_from_slice(&second.encode());
        local.write_all(&bytes).await.unwrap();

        let read = read_one_frame(&mut remote, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(read.pending.len(), 1);
        match &read.pending[0] {
            Decoded::Frame(got) => assert_eq!(*got, second),
            other => panic!("unexpected {:?}", other),
        }
    }
}

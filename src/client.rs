//! SSNTP client: dial, handshake, and the frame loop.
//!
//! [`Client::dial`] opens the transport, completes the TLS and SSNTP
//! handshakes, and spawns the connection tasks:
//! 1. Open TCP or Unix-socket transport, complete mutual TLS.
//! 2. Send CONNECT carrying the declared role bitmask.
//! 3. Await exactly one frame; it must be STATUS/CONNECTED with a role
//!    covered by the server certificate (when role verification is on).
//! 4. Store peer UUIDs and the cluster configuration, spawn the reader
//!    and writer tasks, dispatch frames to the embedder's handler.
//!
//! Any other first frame, a version mismatch, or a role mismatch aborts
//! the handshake with a best-effort ERROR/ConnectionAborted.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::connection::{
    read_one_frame, run_frame_pump, ConnectionStatus, PumpEnd, StatusGuard,
};
use crate::error::{Result, SsntpError};
use crate::handler::{DisconnectReason, EventHandler};
use crate::identity::{IdentityStore, LockedUuid};
use crate::protocol::{Command, Decoded, ErrorKind, Frame, FrameKind, Status, MAJOR};
use crate::role::Role;
use crate::trace::{trace_frame, Direction, TraceConfig};
use crate::transport;
use crate::writer::{spawn_writer, WriterHandle, DEFAULT_QUEUE_DEPTH};
use crate::tls;

/// A connected SSNTP client.
///
/// Cheaply cloneable; all clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    status: StatusGuard,
    writer: WriterHandle,
    shutdown: watch::Sender<bool>,
    handler: Arc<dyn EventHandler>,
    server_uuid: Uuid,
    session_uuid: Uuid,
    local_uuid: Uuid,
    server_role: Role,
    cluster: RwLock<Bytes>,
    trace: Option<TraceConfig>,
    // Keeps the canonical identity lock for the process lifetime.
    _local_identity: Option<LockedUuid>,
}

impl Client {
    /// Connect to an SSNTP server and complete the handshake.
    pub async fn dial(config: Config, handler: Arc<dyn EventHandler>) -> Result<Client> {
        if config.role.is_unknown() {
            return Err(SsntpError::HandshakeViolation(String::from(
                "a declared role is required",
            )));
        }

        let (local_uuid, local_identity) = match config.uuid {
            Some(uuid) => (uuid, None),
            None => {
                let locked = IdentityStore::default().acquire("client", config.role.bits())?;
                (locked.uuid(), Some(locked))
            }
        };

        let status = StatusGuard::new(ConnectionStatus::Idle);
        status.transition(ConnectionStatus::Idle, ConnectionStatus::Connecting)?;

        let raw = transport::dial(&config).await?;
        let mut stream = transport::connect_tls(&config, raw).await?;

        let certified = if config.role_verification {
            let chain = stream.peer_certificates().ok_or_else(|| {
                SsntpError::CertificateInvalid(String::from("server presented no certificate"))
            })?;
            Some(tls::certified_role(&chain)?)
        } else {
            None
        };

        let connect = Frame::connect(config.role);
        trace_frame(&config.trace, local_uuid, Direction::Tx, &connect);
        write_with_deadline(&mut stream, connect.encode()).await?;

        let handshake = read_one_frame(&mut stream, DEFAULT_READ_TIMEOUT).await?;
        let frame = match handshake.first {
            Decoded::Frame(frame) => frame,
            Decoded::UnknownOperand { ty, operand } => {
                abort_handshake(&mut stream).await;
                return Err(SsntpError::HandshakeViolation(format!(
                    "unknown {} operand {:#x} instead of CONNECTED",
                    ty, operand
                )));
            }
        };

        if frame.major != MAJOR {
            abort_handshake(&mut stream).await;
            return Err(SsntpError::VersionMismatch {
                major: frame.major,
                minor: frame.minor,
            });
        }

        if let FrameKind::Error(ErrorKind::ConnectionAborted) = frame.kind {
            // The server rejected the handshake (bad role, bad version).
            return Err(SsntpError::ConnectionAborted);
        }

        if !frame.kind.is_connected() {
            abort_handshake(&mut stream).await;
            return Err(SsntpError::HandshakeViolation(format!(
                "expected CONNECTED, got {}",
                frame.kind
            )));
        }

        let server_role = frame.role.unwrap_or(Role::UNKNOWN);
        if let Some(certified) = certified {
            if !certified.contains(server_role) {
                abort_handshake(&mut stream).await;
                return Err(SsntpError::RoleMismatch {
                    declared: server_role,
                    certified,
                });
            }
        }

        let server_uuid = frame.server_uuid.unwrap_or_else(Uuid::nil);
        let session_uuid = frame.client_uuid.unwrap_or_else(Uuid::nil);
        let cluster_config = frame.payload.clone();
        trace_frame(&config.trace, session_uuid, Direction::Rx, &frame);

        status.transition(ConnectionStatus::Connecting, ConnectionStatus::Connected)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writer, writer_task) = spawn_writer(
            write_half,
            shutdown_rx.clone(),
            DEFAULT_WRITE_TIMEOUT,
            DEFAULT_QUEUE_DEPTH,
        );

        let inner = Arc::new(ClientInner {
            status,
            writer,
            shutdown: shutdown_tx,
            handler,
            server_uuid,
            session_uuid,
            local_uuid,
            server_role,
            cluster: RwLock::new(cluster_config.clone()),
            trace: config.trace,
            _local_identity: local_identity,
        });

        inner
            .handler
            .on_connect(server_uuid, server_role, &cluster_config);

        let reader_inner = inner.clone();
        let carry = (handshake.pending, handshake.frames);
        tokio::spawn(async move {
            reader_inner.read_task(read_half, shutdown_rx, carry).await;
        });

        let writer_inner = inner.clone();
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("writer task failed: {}", e);
                    writer_inner.finish(DisconnectReason::TransportError);
                }
                Err(e) => warn!("writer task panicked: {}", e),
            }
        });

        Ok(Client { inner })
    }

    /// Send a COMMAND frame. CONNECT is owned by [`Client::dial`] and is
    /// rejected here.
    pub async fn send_command(&self, command: Command, payload: &[u8]) -> Result<()> {
        if command == Command::Connect {
            return Err(SsntpError::HandshakeViolation(String::from(
                "CONNECT is sent during dial",
            )));
        }
        self.send_frame(Frame::command(command, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send a STATUS frame. CONNECTED is server-only and is rejected here.
    pub async fn send_status(&self, status: Status, payload: &[u8]) -> Result<()> {
        if status == Status::Connected {
            return Err(SsntpError::HandshakeViolation(String::from(
                "CONNECTED is emitted by servers only",
            )));
        }
        self.send_frame(Frame::status(status, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send an EVENT frame.
    pub async fn send_event(&self, event: crate::protocol::Event, payload: &[u8]) -> Result<()> {
        self.send_frame(Frame::event(event, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send an ERROR frame.
    pub async fn send_error(&self, error: ErrorKind, payload: &[u8]) -> Result<()> {
        self.send_frame(Frame::error(error, Bytes::copy_from_slice(payload)))
            .await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.inner.status.ensure_connected()?;
        trace_frame(
            &self.inner.trace,
            self.inner.session_uuid,
            Direction::Tx,
            &frame,
        );
        self.inner.writer.send(frame.encode()).await
    }

    /// The session UUID the server assigned to this client.
    pub fn session_uuid(&self) -> Uuid {
        self.inner.session_uuid
    }

    /// The persistent local identity (configured or from the identity
    /// store).
    pub fn local_uuid(&self) -> Uuid {
        self.inner.local_uuid
    }

    /// The server's UUID.
    pub fn server_uuid(&self) -> Uuid {
        self.inner.server_uuid
    }

    /// The role bitmask the server declared in CONNECTED.
    pub fn server_role(&self) -> Role {
        self.inner.server_role
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    /// The latest cluster configuration snapshot (from CONNECTED, updated
    /// by CONFIGURE).
    pub fn cluster_configuration(&self) -> Bytes {
        self.inner.cluster.read().unwrap().clone()
    }

    /// Close the connection. Idempotent; pending outbound frames are
    /// drained, further sends fail with `ConnectionFailure`.
    pub fn close(&self) {
        self.inner.finish(DisconnectReason::Shutdown);
    }
}

impl ClientInner {
    async fn read_task(
        self: Arc<Self>,
        reader: tokio::io::ReadHalf<transport::ClientStream>,
        shutdown: watch::Receiver<bool>,
        carry: (Vec<Decoded>, crate::protocol::FrameBuffer),
    ) {
        let mut stop_reason = DisconnectReason::Aborted;
        let result = run_frame_pump(
            reader,
            shutdown,
            DEFAULT_READ_TIMEOUT,
            Some(carry),
            |decoded| self.dispatch(decoded, &mut stop_reason),
        )
        .await;

        let reason = match result {
            Ok(PumpEnd::Eof) => DisconnectReason::PeerClosed,
            Ok(PumpEnd::Shutdown) => DisconnectReason::Shutdown,
            Ok(PumpEnd::Stopped) => stop_reason,
            Err(SsntpError::Timeout) => DisconnectReason::TransportError,
            Err(SsntpError::InvalidFrame(e)) => {
                warn!("protocol violation from server: {}", e);
                let reply = Frame::error(ErrorKind::InvalidFrameType, Bytes::new());
                let _ = self.writer.try_send(reply.encode());
                DisconnectReason::ProtocolViolation
            }
            Err(e) => {
                warn!("connection error: {}", e);
                DisconnectReason::TransportError
            }
        };

        self.finish(reason);
    }

    fn dispatch(&self, decoded: Decoded, stop_reason: &mut DisconnectReason) -> Result<bool> {
        let frame = match decoded {
            Decoded::Frame(frame) => frame,
            Decoded::UnknownOperand { ty, operand } => {
                warn!("unknown {} operand {:#x}", ty, operand);
                let reply = Frame::error(ErrorKind::InvalidFrameType, Bytes::new());
                let _ = self.writer.try_send(reply.encode());
                return Ok(true);
            }
        };

        trace_frame(&self.trace, self.session_uuid, Direction::Rx, &frame);

        match frame.kind {
            // CONNECTED is emitted exactly once per handshake; a second
            // one is a handshake replay.
            FrameKind::Status(Status::Connected) | FrameKind::Command(Command::Connect) => {
                warn!("handshake frame {} on established connection", frame.kind);
                let reply = Frame::error(ErrorKind::ConnectionAborted, Bytes::new());
                let _ = self.writer.try_send(reply.encode());
                *stop_reason = DisconnectReason::ProtocolViolation;
                Ok(false)
            }
            FrameKind::Command(Command::Configure) => {
                *self.cluster.write().unwrap() = frame.payload.clone();
                self.handler
                    .on_command(self.server_uuid, Command::Configure, &frame.payload);
                Ok(true)
            }
            FrameKind::Command(command) => {
                self.handler
                    .on_command(self.server_uuid, command, &frame.payload);
                Ok(true)
            }
            FrameKind::Status(status) => {
                self.handler
                    .on_status(self.server_uuid, status, &frame.payload);
                Ok(true)
            }
            FrameKind::Event(event) => {
                self.handler
                    .on_event(self.server_uuid, event, &frame.payload);
                Ok(true)
            }
            FrameKind::Error(ErrorKind::ConnectionAborted) => {
                *stop_reason = DisconnectReason::Aborted;
                Ok(false)
            }
            FrameKind::Error(error) => {
                self.handler.on_error(self.server_uuid, error, &frame.payload);
                Ok(true)
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        if self.status.close() {
            let _ = self.shutdown.send(true);
            self.handler.on_disconnect(self.server_uuid, reason);
        }
    }
}

async fn write_with_deadline<S>(stream: &mut S, bytes: Bytes) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let io = async {
        stream.write_all(&bytes).await?;
        stream.flush().await
    };
    match timeout(DEFAULT_WRITE_TIMEOUT, io).await {
        Ok(result) => result.map_err(SsntpError::Io),
        Err(_) => Err(SsntpError::Timeout),
    }
}

/// Best-effort ERROR/ConnectionAborted before tearing a handshake down.
async fn abort_handshake<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let frame = Frame::error(ErrorKind::ConnectionAborted, Bytes::new());
    let _ = write_with_deadline(stream, frame.encode()).await;
}

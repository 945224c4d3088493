//! SSNTP server: accept loop, peer directory, and frame forwarding.
//!
//! A server (usually the scheduler hub) accepts mutually-authenticated
//! connections, completes the CONNECT/CONNECTED handshake, and keeps a
//! directory of connected peers keyed by the UUID it assigned to each.
//! Every inbound frame is either handled locally, relayed according to the
//! forwarding table, or dropped; relays copy the ingress octets so the
//! egress image is bit-identical.
//!
//! The server also owns the cluster configuration: a copy-on-write byte
//! buffer echoed in every CONNECTED frame and pushed to all peers via
//! CONFIGURE. A peer reporting ERROR/InvalidConfiguration reverts the hub
//! to the previous snapshot, which is then re-broadcast.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::connection::{
    read_one_frame, run_frame_pump, ConnectionStatus, PumpEnd, StatusGuard,
};
use crate::error::{Result, SsntpError};
use crate::forward::{
    default_overflow, payload_destination, ForwardAction, ForwardTable, OverflowPolicy,
};
use crate::handler::{DisconnectReason, EventHandler};
use crate::identity::{IdentityStore, LockedUuid};
use crate::protocol::{
    Command, Decoded, ErrorKind, Event, Frame, FrameKind, Status, MAJOR,
};
use crate::role::Role;
use crate::tls;
use crate::trace::{trace_frame, Direction, TraceConfig};
use crate::transport::{self, Listener, RawStream, ServerStream};
use crate::writer::{spawn_writer, WriterHandle, DEFAULT_QUEUE_DEPTH};

/// The hub's view of the cluster configuration: the live snapshot plus one
/// level of history for reverts.
#[derive(Debug, Default)]
struct ClusterConfiguration {
    current: Bytes,
    previous: Option<Bytes>,
}

impl ClusterConfiguration {
    fn update(&mut self, next: Bytes) {
        self.previous = Some(std::mem::replace(&mut self.current, next));
    }

    /// Fall back to the previous snapshot. One-deep: a second revert
    /// without an intervening update returns `None`, so failure reports
    /// cannot ping-pong configurations.
    fn revert(&mut self) -> Option<Bytes> {
        let previous = self.previous.take()?;
        self.current = previous.clone();
        Some(previous)
    }
}

/// A connected peer in the hub's directory.
#[derive(Clone)]
struct Peer {
    uuid: Uuid,
    role: Role,
    writer: WriterHandle,
    shutdown: Arc<watch::Sender<bool>>,
}

/// A running SSNTP server.
///
/// Cheaply cloneable; all clones share one listener and peer directory.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
    local_addr: Option<SocketAddr>,
}

struct ServerInner {
    uuid: Uuid,
    role: Role,
    role_verification: bool,
    handler: Arc<dyn EventHandler>,
    peers: RwLock<HashMap<Uuid, Peer>>,
    cluster: RwLock<ClusterConfiguration>,
    rules: ForwardTable,
    trace: Option<TraceConfig>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _identity: Option<LockedUuid>,
}

impl Server {
    /// Bind a listener and start serving SSNTP connections.
    ///
    /// The server derives its certified role from its own certificate at
    /// startup; a certificate with no recognized role OID is a hard
    /// failure. An unset `config.role` defaults to the certified role.
    pub async fn bind(config: Config, handler: Arc<dyn EventHandler>) -> Result<Server> {
        let certified = tls::own_certified_role(&config.cert)?;
        if certified.is_unknown() {
            return Err(SsntpError::CertificateInvalid(String::from(
                "server certificate carries no SSNTP role OID",
            )));
        }

        let role = if config.role.is_unknown() {
            certified
        } else {
            config.role
        };
        if config.role_verification && !certified.contains(role) {
            return Err(SsntpError::RoleMismatch {
                declared: role,
                certified,
            });
        }

        let (uuid, identity) = match config.uuid {
            Some(uuid) => (uuid, None),
            None => {
                let locked = IdentityStore::default().acquire("server", role.bits())?;
                (locked.uuid(), Some(locked))
            }
        };

        let acceptor = transport::acceptor(&config)?;
        let listener = Listener::bind(&config).await?;
        let local_addr = listener.local_addr();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            uuid,
            role,
            role_verification: config.role_verification,
            handler,
            peers: RwLock::new(HashMap::new()),
            cluster: RwLock::new(ClusterConfiguration::default()),
            rules: ForwardTable::new(config.forward_rules.clone()),
            trace: config.trace.clone(),
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            _identity: identity,
        });

        info!(%uuid, role = %role, "SSNTP server listening");

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            accept_inner.accept_loop(listener, acceptor, shutdown_rx).await;
        });
        inner.tasks.lock().unwrap().push(accept_task);

        Ok(Server { inner, local_addr })
    }

    /// The bound TCP address, when listening over TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The server's identity UUID, carried in every CONNECTED frame.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// The server's declared role bitmask.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// UUIDs and roles of the currently connected peers.
    pub fn connected_peers(&self) -> Vec<(Uuid, Role)> {
        self.inner
            .peers
            .read()
            .unwrap()
            .values()
            .map(|peer| (peer.uuid, peer.role))
            .collect()
    }

    /// Send a COMMAND frame to one connected peer. This is how an
    /// embedder's scheduling policy pushes START to the agent it chose.
    pub async fn send_command_to(&self, dest: Uuid, command: Command, payload: &[u8]) -> Result<()> {
        if command == Command::Connect {
            return Err(SsntpError::HandshakeViolation(String::from(
                "CONNECT is client-only",
            )));
        }
        self.send_to(dest, Frame::command(command, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send a STATUS frame to one connected peer. CONNECTED is owned by
    /// the handshake and is rejected here.
    pub async fn send_status_to(&self, dest: Uuid, status: Status, payload: &[u8]) -> Result<()> {
        if status == Status::Connected {
            return Err(SsntpError::HandshakeViolation(String::from(
                "CONNECTED is emitted by the handshake",
            )));
        }
        self.send_to(dest, Frame::status(status, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send an EVENT frame to one connected peer.
    pub async fn send_event_to(&self, dest: Uuid, event: Event, payload: &[u8]) -> Result<()> {
        self.send_to(dest, Frame::event(event, Bytes::copy_from_slice(payload)))
            .await
    }

    /// Send an ERROR frame to one connected peer.
    pub async fn send_error_to(&self, dest: Uuid, error: ErrorKind, payload: &[u8]) -> Result<()> {
        self.send_to(dest, Frame::error(error, Bytes::copy_from_slice(payload)))
            .await
    }

    async fn send_to(&self, dest: Uuid, frame: Frame) -> Result<()> {
        let peer = self
            .inner
            .peers
            .read()
            .unwrap()
            .get(&dest)
            .cloned()
            .ok_or(SsntpError::ConnectionFailure)?;

        trace_frame(&self.inner.trace, self.inner.uuid, Direction::Tx, &frame);
        peer.writer.send(frame.encode()).await
    }

    /// Push a new cluster configuration: updates the hub's snapshot and
    /// broadcasts CONFIGURE to every connected peer.
    pub fn configure(&self, payload: &[u8]) {
        let payload = Bytes::copy_from_slice(payload);
        self.inner
            .cluster
            .write()
            .unwrap()
            .update(payload.clone());

        let frame = Frame::command(Command::Configure, payload);
        self.inner.broadcast(frame.encode(), &frame.kind);
    }

    /// The current cluster configuration snapshot.
    pub fn cluster_configuration(&self) -> Bytes {
        self.inner.cluster.read().unwrap().current.clone()
    }

    /// Stop accepting, close every peer, and wait for connection tasks to
    /// drain their outbound queues, up to `deadline`. Tasks still running
    /// at the deadline are aborted.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = self.inner.shutdown.send(true);

        let peers: Vec<Peer> = self
            .inner
            .peers
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for peer in peers {
            let _ = peer.shutdown.send(true);
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        let start = Instant::now();
        for task in tasks {
            let abort = task.abort_handle();
            let remaining = deadline.saturating_sub(start.elapsed());
            if timeout(remaining, task).await.is_err() {
                warn!("connection task did not drain before the shutdown deadline");
                abort.abort();
            }
        }
    }
}

impl ServerInner {
    async fn accept_loop(
        self: Arc<Self>,
        listener: Listener,
        acceptor: tokio_rustls::TlsAcceptor,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let raw = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("incoming connection failed: {}", e);
                        continue;
                    }
                },
            };

            let conn_inner = self.clone();
            let conn_acceptor = acceptor.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = conn_inner.handle_connection(conn_acceptor, raw).await {
                    debug!("connection ended with error: {}", e);
                }
            });
            self.tasks.lock().unwrap().push(task);
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        acceptor: tokio_rustls::TlsAcceptor,
        raw: RawStream,
    ) -> Result<()> {
        let mut stream = transport::accept_tls(&acceptor, raw).await?;
        let status = StatusGuard::new(ConnectionStatus::Connecting);

        let certified = if self.role_verification {
            let chain = stream.peer_certificates().ok_or_else(|| {
                SsntpError::CertificateInvalid(String::from("client presented no certificate"))
            })?;
            Some(tls::certified_role(&chain)?)
        } else {
            None
        };

        // The first frame must be CONNECT; nothing else is accepted while
        // connecting.
        let handshake = read_one_frame(&mut stream, DEFAULT_READ_TIMEOUT).await?;
        let frame = match handshake.first {
            Decoded::Frame(frame) => frame,
            Decoded::UnknownOperand { ty, operand } => {
                abort_handshake(&mut stream).await;
                return Err(SsntpError::HandshakeViolation(format!(
                    "unknown {} operand {:#x} instead of CONNECT",
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

        if !frame.kind.is_connect() {
            abort_handshake(&mut stream).await;
            return Err(SsntpError::HandshakeViolation(format!(
                "expected CONNECT, got {}",
                frame.kind
            )));
        }

        let declared = frame.role.unwrap_or(Role::UNKNOWN);
        if declared.is_unknown() {
            abort_handshake(&mut stream).await;
            return Err(SsntpError::HandshakeViolation(String::from(
                "client declared no role",
            )));
        }

        if let Some(certified) = certified {
            if !certified.contains(declared) {
                warn!(%declared, %certified, "role not covered by client certificate");
                abort_handshake(&mut stream).await;
                return Err(SsntpError::RoleMismatch {
                    declared,
                    certified,
                });
            }
        }

        // The hub's view of the client: a fresh session UUID, which keys
        // the peer directory and is echoed back in CONNECTED.
        let client_uuid = Uuid::new_v4();
        let snapshot = self.cluster.read().unwrap().current.clone();
        let connected = Frame::connected(self.role, self.uuid, client_uuid, snapshot.clone());
        trace_frame(&self.trace, self.uuid, Direction::Tx, &connected);
        write_with_deadline(&mut stream, connected.encode()).await?;

        status.transition(ConnectionStatus::Connecting, ConnectionStatus::Connected)?;
        info!(peer = %client_uuid, role = %declared, "peer connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let (peer_shutdown_tx, peer_shutdown_rx) = watch::channel(false);
        let (writer, _writer_task) = spawn_writer(
            write_half,
            peer_shutdown_rx.clone(),
            DEFAULT_WRITE_TIMEOUT,
            DEFAULT_QUEUE_DEPTH,
        );

        let peer = Peer {
            uuid: client_uuid,
            role: declared,
            writer,
            shutdown: Arc::new(peer_shutdown_tx),
        };
        self.peers
            .write()
            .unwrap()
            .insert(client_uuid, peer.clone());

        self.handler.on_connect(client_uuid, declared, &snapshot);
        self.broadcast_node_event(Event::NodeConnected, client_uuid, declared);

        let mut stop_reason = DisconnectReason::Aborted;
        let result = run_frame_pump(
            read_half,
            peer_shutdown_rx,
            DEFAULT_READ_TIMEOUT,
            Some((handshake.pending, handshake.frames)),
            |decoded| self.dispatch(&peer, decoded, &mut stop_reason),
        )
        .await;

        let reason = match &result {
            Ok(PumpEnd::Eof) => DisconnectReason::PeerClosed,
            Ok(PumpEnd::Shutdown) => DisconnectReason::Shutdown,
            Ok(PumpEnd::Stopped) => stop_reason,
            Err(SsntpError::Timeout) => DisconnectReason::TransportError,
            Err(SsntpError::InvalidFrame(e)) => {
                warn!(peer = %client_uuid, "protocol violation: {}", e);
                let reply = Frame::error(ErrorKind::InvalidFrameType, Bytes::new());
                let _ = peer.writer.try_send(reply.encode());
                DisconnectReason::ProtocolViolation
            }
            Err(_) => DisconnectReason::TransportError,
        };

        status.close();
        self.peers.write().unwrap().remove(&client_uuid);
        // Wakes the writer task so queued frames drain and the stream
        // closes.
        let _ = peer.shutdown.send(true);

        info!(peer = %client_uuid, ?reason, "peer disconnected");
        self.handler.on_disconnect(client_uuid, reason);
        self.broadcast_node_event(Event::NodeDisconnected, client_uuid, declared);

        result.map(|_| ())
    }

    fn dispatch(
        &self,
        peer: &Peer,
        decoded: Decoded,
        stop_reason: &mut DisconnectReason,
    ) -> Result<bool> {
        let frame = match decoded {
            Decoded::UnknownOperand { ty, operand } => {
                warn!(peer = %peer.uuid, "unknown {} operand {:#x}", ty, operand);
                let reply = Frame::error(ErrorKind::InvalidFrameType, Bytes::new());
                let _ = peer.writer.try_send(reply.encode());
                return Ok(true);
            }
            Decoded::Frame(frame) => frame,
        };

        trace_frame(&self.trace, self.uuid, Direction::Rx, &frame);

        match frame.kind {
            // CONNECT is only legal as the first frame, and CONNECTED is
            // only ever emitted by servers.
            FrameKind::Command(Command::Connect) | FrameKind::Status(Status::Connected) => {
                warn!(peer = %peer.uuid, "handshake frame {} on established connection", frame.kind);
                let reply = Frame::error(ErrorKind::ConnectionAborted, Bytes::new());
                let _ = peer.writer.try_send(reply.encode());
                *stop_reason = DisconnectReason::ProtocolViolation;
                Ok(false)
            }
            FrameKind::Command(Command::Configure) => {
                self.cluster
                    .write()
                    .unwrap()
                    .update(frame.payload.clone());
                self.handler
                    .on_command(peer.uuid, Command::Configure, &frame.payload);
                self.broadcast(frame.wire_image(), &frame.kind);
                Ok(true)
            }
            FrameKind::Error(ErrorKind::InvalidConfiguration) => {
                let reverted = self.cluster.write().unwrap().revert();
                if let Some(previous) = reverted {
                    warn!(peer = %peer.uuid, "invalid configuration reported, reverting");
                    let frame = Frame::command(Command::Configure, previous);
                    self.broadcast(frame.encode(), &frame.kind);
                }
                self.handler
                    .on_error(peer.uuid, ErrorKind::InvalidConfiguration, &frame.payload);
                Ok(true)
            }
            FrameKind::Error(ErrorKind::ConnectionAborted) => {
                *stop_reason = DisconnectReason::Aborted;
                Ok(false)
            }
            _ => {
                self.route(peer, frame);
                Ok(true)
            }
        }
    }

    /// Apply the forwarding policy to one inbound frame.
    fn route(&self, peer: &Peer, frame: Frame) {
        let (action, overflow) = self.rules.decide(&frame.kind, peer.role);
        match action {
            ForwardAction::Deliver => self.deliver_local(peer.uuid, &frame),
            ForwardAction::ToRoles(mask) => {
                let dests: Vec<Peer> = self
                    .peers
                    .read()
                    .unwrap()
                    .values()
                    .filter(|dest| dest.role.intersects(mask) && dest.uuid != peer.uuid)
                    .cloned()
                    .collect();
                for dest in dests {
                    self.relay(&dest, frame.wire_image(), &frame.kind, overflow);
                }
            }
            ForwardAction::ToUuids(uuids) => {
                for uuid in uuids {
                    let dest = self.peers.read().unwrap().get(&uuid).cloned();
                    match dest {
                        Some(dest) => self.relay(&dest, frame.wire_image(), &frame.kind, overflow),
                        None => debug!(%uuid, "forward destination not connected"),
                    }
                }
            }
            ForwardAction::ToPayloadUuid { role } => {
                let target = match payload_destination(&frame.payload) {
                    Some(uuid) => uuid,
                    None => {
                        warn!(frame = %frame.kind, "payload carries no destination UUID");
                        return;
                    }
                };
                let dest = self.peers.read().unwrap().get(&target).cloned();
                match dest {
                    Some(dest) if dest.role.intersects(role) => {
                        self.relay(&dest, frame.wire_image(), &frame.kind, overflow);
                    }
                    Some(dest) => {
                        warn!(%target, role = %dest.role, "destination lacks the addressed role");
                    }
                    None => debug!(%target, "addressed peer not connected"),
                }
            }
            ForwardAction::Drop => {
                debug!(frame = %frame.kind, "frame dropped by forwarding rule");
            }
        }
    }

    /// Relay an exact wire image to one peer, applying the overflow policy
    /// when its queue is full.
    fn relay(&self, dest: &Peer, wire: Bytes, kind: &FrameKind, overflow: OverflowPolicy) {
        match dest.writer.try_send(wire) {
            Ok(()) => {}
            Err(SsntpError::QueueOverflow) => match overflow {
                OverflowPolicy::DropAndWarn => {
                    warn!(peer = %dest.uuid, frame = %kind, "send queue full, frame dropped");
                }
                OverflowPolicy::ClosePeer => {
                    warn!(peer = %dest.uuid, frame = %kind, "send queue full, closing slow peer");
                    let _ = dest.shutdown.send(true);
                }
            },
            Err(_) => debug!(peer = %dest.uuid, "peer already gone"),
        }
    }

    fn deliver_local(&self, sender: Uuid, frame: &Frame) {
        match frame.kind {
            FrameKind::Command(command) => self.handler.on_command(sender, command, &frame.payload),
            FrameKind::Status(status) => self.handler.on_status(sender, status, &frame.payload),
            FrameKind::Event(event) => self.handler.on_event(sender, event, &frame.payload),
            FrameKind::Error(error) => self.handler.on_error(sender, error, &frame.payload),
        }
    }

    /// Broadcast an exact wire image to every connected peer.
    fn broadcast(&self, wire: Bytes, kind: &FrameKind) {
        let overflow = default_overflow(kind);
        let dests: Vec<Peer> = self.peers.read().unwrap().values().cloned().collect();
        for dest in dests {
            self.relay(&dest, wire.clone(), kind, overflow);
        }
    }

    /// Tell the Controllers about compute and networking nodes coming and
    /// going.
    fn broadcast_node_event(&self, event: Event, node: Uuid, role: Role) {
        if !role.intersects(Role::AGENT | Role::NETAGENT | Role::CNCIAGENT) {
            return;
        }

        let payload = serde_json::json!({
            "node_uuid": node.to_string(),
            "role": role.to_string(),
        });
        let payload = match serde_json::to_vec(&payload) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("node event payload: {}", e);
                return;
            }
        };

        let frame = Frame::event(event, payload);
        let wire = frame.encode();
        let overflow = default_overflow(&frame.kind);
        let dests: Vec<Peer> = self
            .peers
            .read()
            .unwrap()
            .values()
            .filter(|dest| dest.role.intersects(Role::CONTROLLER))
            .cloned()
            .collect();
        for dest in dests {
            self.relay(&dest, wire.clone(), &frame.kind, overflow);
        }
    }
}

async fn write_with_deadline(stream: &mut ServerStream, bytes: Bytes) -> Result<()> {
    use tokio::io::AsyncWriteExt;

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
async fn abort_handshake(stream: &mut ServerStream) {
    let frame = Frame::error(ErrorKind::ConnectionAborted, Bytes::new());
    let _ = write_with_deadline(stream, frame.encode()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_configuration_update_and_revert() {
        let mut cluster = ClusterConfiguration::default();

        cluster.update(Bytes::from_static(b"v1"));
        assert_eq!(cluster.current, Bytes::from_static(b"v1"));

        cluster.update(Bytes::from_static(b"v2"));
        assert_eq!(cluster.current, Bytes::from_static(b"v2"));

        let reverted = cluster.revert().unwrap();
        assert_eq!(reverted, Bytes::from_static(b"v1"));
        assert_eq!(cluster.current, Bytes::from_static(b"v1"));

        // One-deep history: no second revert.
        assert!(cluster.revert().is_none());
    }
}

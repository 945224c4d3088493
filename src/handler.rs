//! Callback surface exposed to embedders.
//!
//! An embedder supplies a single object implementing [`EventHandler`];
//! every method has a no-op default so implementations only override what
//! they care about.
//!
//! Handlers run inline on the connection's receive path, which is what
//! preserves causal frame order end to end. They must not block; long
//! work belongs on a task of the embedder's own.

use uuid::Uuid;

use crate::protocol::{Command, ErrorKind, Event, Status};
use crate::role::Role;

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    PeerClosed,
    /// The peer (or local policy) aborted the connection.
    Aborted,
    /// The transport failed or a deadline expired.
    TransportError,
    /// The peer violated the protocol (bad frame type, handshake replay).
    ProtocolViolation,
    /// The peer was too slow to drain a critical frame.
    QueueOverflow,
    /// The local endpoint is shutting down.
    Shutdown,
}

/// SSNTP frame and lifecycle callbacks.
///
/// `sender` is the session UUID of the peer the frame came from. Payloads
/// are opaque octets; only the embedder knows their schema.
pub trait EventHandler: Send + Sync + 'static {
    /// A COMMAND frame arrived.
    fn on_command(&self, sender: Uuid, command: Command, payload: &[u8]) {
        let _ = (sender, command, payload);
    }

    /// A STATUS frame arrived.
    fn on_status(&self, sender: Uuid, status: Status, payload: &[u8]) {
        let _ = (sender, status, payload);
    }

    /// An EVENT frame arrived.
    fn on_event(&self, sender: Uuid, event: Event, payload: &[u8]) {
        let _ = (sender, event, payload);
    }

    /// An ERROR frame arrived.
    fn on_error(&self, sender: Uuid, error: ErrorKind, payload: &[u8]) {
        let _ = (sender, error, payload);
    }

    /// A peer completed its handshake. On servers `peer` is the client
    /// that connected; on clients it is the server. `cluster_config` is
    /// the configuration snapshot exchanged in CONNECTED.
    fn on_connect(&self, peer: Uuid, peer_role: Role, cluster_config: &[u8]) {
        let _ = (peer, peer_role, cluster_config);
    }

    /// A peer went away.
    fn on_disconnect(&self, peer: Uuid, reason: DisconnectReason) {
        let _ = (peer, reason);
    }
}

/// A handler that ignores everything. Useful for endpoints that only send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl EventHandler for NullHandler {}

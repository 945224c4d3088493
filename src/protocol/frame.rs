//! Frame struct with encode and one-shot decode.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing. Frames produced by
//! [`Frame::decode`] (and by the stream decoder) keep the exact octet
//! sequence they were parsed from; a hub relays that image untouched so a
//! forwarded frame is bit-identical on the egress link.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::wire_format::{
    Command, ErrorKind, Event, FrameKind, KindFromCodes, Status, MAJOR, MINOR, PAYLOAD_LEN_SIZE,
    PRELUDE_SIZE, ROLE_SIZE, UUID_SIZE,
};
use crate::error::{Result, SsntpError};
use crate::role::Role;

/// A complete SSNTP frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol major version.
    pub major: u8,
    /// Protocol minor version.
    pub minor: u8,
    /// The (type, operand) pair.
    pub kind: FrameKind,
    /// Role bitmask, present on CONNECT and CONNECTED only.
    pub role: Option<Role>,
    /// Server UUID, present on CONNECTED only.
    pub server_uuid: Option<Uuid>,
    /// Client UUID, present on CONNECTED only.
    pub client_uuid: Option<Uuid>,
    /// Payload octets. Opaque to the protocol core.
    pub payload: Bytes,
    /// Exact wire image for decoded frames.
    wire: Option<Bytes>,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Frame) -> bool {
        // The cached wire image is derived state and excluded.
        self.major == other.major
            && self.minor == other.minor
            && self.kind == other.kind
            && self.role == other.role
            && self.server_uuid == other.server_uuid
            && self.client_uuid == other.client_uuid
            && self.payload == other.payload
    }
}

impl Eq for Frame {}

impl Frame {
    fn new(kind: FrameKind, payload: Bytes) -> Frame {
        Frame {
            major: MAJOR,
            minor: MINOR,
            kind,
            role: None,
            server_uuid: None,
            client_uuid: None,
            payload,
            wire: None,
        }
    }

    /// Build a CONNECT frame declaring the client role bitmask.
    pub fn connect(role: Role) -> Frame {
        let mut frame = Frame::new(FrameKind::Command(Command::Connect), Bytes::new());
        frame.role = Some(role);
        frame
    }

    /// Build a CONNECTED frame: the server reply completing a handshake.
    /// Carries the server role bitmask, both peer UUIDs and the current
    /// cluster configuration as payload.
    pub fn connected(role: Role, server_uuid: Uuid, client_uuid: Uuid, config: Bytes) -> Frame {
        let mut frame = Frame::new(FrameKind::Status(Status::Connected), config);
        frame.role = Some(role);
        frame.server_uuid = Some(server_uuid);
        frame.client_uuid = Some(client_uuid);
        frame
    }

    /// Build a COMMAND frame. CONNECT cannot be built this way; use
    /// [`Frame::connect`] so the role field is populated.
    pub fn command(command: Command, payload: Bytes) -> Frame {
        debug_assert!(command != Command::Connect, "use Frame::connect");
        Frame::new(FrameKind::Command(command), payload)
    }

    /// Build a STATUS frame. CONNECTED cannot be built this way; use
    /// [`Frame::connected`].
    pub fn status(status: Status, payload: Bytes) -> Frame {
        debug_assert!(status != Status::Connected, "use Frame::connected");
        Frame::new(FrameKind::Status(status), payload)
    }

    /// Build an ERROR frame.
    pub fn error(error: ErrorKind, payload: Bytes) -> Frame {
        Frame::new(FrameKind::Error(error), payload)
    }

    /// Build an EVENT frame.
    pub fn event(event: Event, payload: Bytes) -> Frame {
        Frame::new(FrameKind::Event(event), payload)
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        header_len(&self.kind) + self.payload.len()
    }

    /// Serialize the frame.
    ///
    /// Encoding is total over the closed set: the constructors guarantee
    /// the optional fields required by the kind are present, and missing
    /// ones fall back to the zero role / nil UUID.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u8(self.kind.type_code());
        buf.put_u8(self.kind.operand_code());

        if self.kind.carries_role() {
            buf.put_u32(self.role.unwrap_or(Role::UNKNOWN).bits());
        }

        if self.kind.carries_uuids() {
            buf.put_slice(self.server_uuid.unwrap_or(Uuid::nil()).as_bytes());
            buf.put_slice(self.client_uuid.unwrap_or(Uuid::nil()).as_bytes());
        }

        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode exactly one frame from the head of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. Fails with
    /// [`SsntpError::InvalidFrame`] when the (type, operand) pair is outside
    /// the closed set and with [`SsntpError::Truncated`] when `buf` ends
    /// before the frame does.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
        if buf.len() < PRELUDE_SIZE {
            return Err(SsntpError::Truncated {
                needed: PRELUDE_SIZE - buf.len(),
            });
        }

        let kind = match FrameKind::from_codes(buf[2], buf[3]) {
            KindFromCodes::Known(kind) => kind,
            KindFromCodes::UnknownOperand { ty, operand } => {
                return Err(SsntpError::InvalidFrame(format!(
                    "unknown {} operand {:#x}",
                    ty, operand
                )));
            }
            KindFromCodes::UnknownType { code } => {
                return Err(SsntpError::InvalidFrame(format!(
                    "unknown frame type {:#x}",
                    code
                )));
            }
        };

        let hdr = header_len(&kind);
        if buf.len() < hdr {
            return Err(SsntpError::Truncated {
                needed: hdr - buf.len(),
            });
        }

        let payload_len =
            u32::from_be_bytes([buf[hdr - 4], buf[hdr - 3], buf[hdr - 2], buf[hdr - 1]]) as usize;
        let total = hdr + payload_len;
        if buf.len() < total {
            return Err(SsntpError::Truncated {
                needed: total - buf.len(),
            });
        }

        let wire = Bytes::copy_from_slice(&buf[..total]);
        let frame = Frame::from_wire(kind, wire)?;
        Ok((frame, total))
    }

    /// Rebuild a frame from its complete, pre-validated wire image. The
    /// image length must already match the header plus payload length.
    pub(crate) fn from_wire(kind: FrameKind, wire: Bytes) -> Result<Frame> {
        let mut at = PRELUDE_SIZE;

        let role = if kind.carries_role() {
            let bits = u32::from_be_bytes([wire[at], wire[at + 1], wire[at + 2], wire[at + 3]]);
            at += ROLE_SIZE;
            Some(Role::from_bits(bits))
        } else {
            None
        };

        let (server_uuid, client_uuid) = if kind.carries_uuids() {
            let server = Uuid::from_slice(&wire[at..at + UUID_SIZE])
                .map_err(|e| SsntpError::InvalidFrame(format!("server UUID: {}", e)))?;
            at += UUID_SIZE;
            let client = Uuid::from_slice(&wire[at..at + UUID_SIZE])
                .map_err(|e| SsntpError::InvalidFrame(format!("client UUID: {}", e)))?;
            at += UUID_SIZE;
            (Some(server), Some(client))
        } else {
            (None, None)
        };

        at += PAYLOAD_LEN_SIZE;
        let payload = wire.slice(at..);

        Ok(Frame {
            major: wire[0],
            minor: wire[1],
            kind,
            role,
            server_uuid,
            client_uuid,
            payload,
            wire: Some(wire),
        })
    }

    /// The exact octets this frame occupies on the wire.
    ///
    /// For decoded frames this is the ingress image; for locally built
    /// frames it is a fresh encoding.
    pub fn wire_image(&self) -> Bytes {
        match &self.wire {
            Some(wire) => wire.clone(),
            None => self.encode(),
        }
    }
}

/// Header length (everything before the payload) for a frame kind.
pub(crate) fn header_len(kind: &FrameKind) -> usize {
    let mut len = PRELUDE_SIZE + PAYLOAD_LEN_SIZE;
    if kind.carries_role() {
        len += ROLE_SIZE;
    }
    if kind.carries_uuids() {
        len += 2 * UUID_SIZE;
    }
    len
}

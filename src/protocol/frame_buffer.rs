//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Incoming bytes
//! are appended as they arrive from the socket; complete frames are split
//! off and frozen so each decoded frame keeps its exact wire image.
//!
//! A frame with a known type but an out-of-range operand still has the
//! generic wire shape, so the buffer consumes it and reports it as
//! [`Decoded::UnknownOperand`]; the connection stays usable and replies
//! ERROR/InvalidFrameType. An unknown frame *type* makes the rest of the
//! stream unparseable and is a hard error.

use bytes::{Bytes, BytesMut};

use super::frame::{header_len, Frame};
use super::wire_format::{
    FrameKind, FrameType, KindFromCodes, DEFAULT_MAX_PAYLOAD_SIZE, PAYLOAD_LEN_SIZE, PRELUDE_SIZE,
};
use crate::error::{Result, SsntpError};

/// One unit produced by the stream decoder.
#[derive(Debug)]
pub enum Decoded {
    /// A complete, well-formed frame.
    Frame(Frame),
    /// A frame with a known type but an operand outside the closed set.
    /// Its bytes were consumed; the receiver should reply
    /// ERROR/InvalidFrameType and keep the connection open.
    UnknownOperand {
        /// The recognized frame type.
        ty: FrameType,
        /// The out-of-range operand code.
        operand: u8,
    },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default payload cap.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom payload cap.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the decoded units in arrival order; the vector is empty when
    /// more data is needed. Errors are protocol violations that require
    /// aborting the connection (unknown frame type, oversized payload).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Decoded>> {
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(decoded) = self.try_extract_one()? {
            out.push(decoded);
        }

        Ok(out)
    }

    /// Whether a partially received frame is sitting in the buffer.
    ///
    /// Used by the read loop to arm the read deadline only while the peer
    /// is mid-frame; an idle connection carries no deadline.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn try_extract_one(&mut self) -> Result<Option<Decoded>> {
        if self.buffer.len() < PRELUDE_SIZE {
            return Ok(None);
        }

        let (kind, generic) = match FrameKind::from_codes(self.buffer[2], self.buffer[3]) {
            KindFromCodes::Known(kind) => (Some(kind), None),
            KindFromCodes::UnknownOperand { ty, operand } => (None, Some((ty, operand))),
            KindFromCodes::UnknownType { code } => {
                return Err(SsntpError::InvalidFrame(format!(
                    "unknown frame type {:#x}",
                    code
                )));
            }
        };

        // Unknown operands never name CONNECT or CONNECTED, so their frames
        // have the generic prelude + length + payload shape.
        let hdr = match kind {
            Some(ref kind) => header_len(kind),
            None => PRELUDE_SIZE + PAYLOAD_LEN_SIZE,
        };

        if self.buffer.len() < hdr {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([
            self.buffer[hdr - 4],
            self.buffer[hdr - 3],
            self.buffer[hdr - 2],
            self.buffer[hdr - 1],
        ]);
        if payload_len > self.max_payload_size {
            return Err(SsntpError::InvalidFrame(format!(
                "payload size {} exceeds maximum {}",
                payload_len, self.max_payload_size
            )));
        }

        let total = hdr + payload_len as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let wire: Bytes = self.buffer.split_to(total).freeze();

        match (kind, generic) {
            (Some(kind), _) => Ok(Some(Decoded::Frame(Frame::from_wire(kind, wire)?))),
            (None, Some((ty, operand))) => Ok(Some(Decoded::UnknownOperand { ty, operand })),
            (None, None) => unreachable!("classification is exhaustive"),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::{Command, Event, Status};
    use crate::role::Role;
    use uuid::Uuid;

    fn expect_frame(decoded: Decoded) -> Frame {
        match decoded {
            Decoded::Frame(frame) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::command(Command::Start, Bytes::from_static(b"hello"));

        let decoded = buffer.push(&frame.encode()).unwrap();

        assert_eq!(decoded.len(), 1);
        let got = expect_frame(decoded.into_iter().next().unwrap());
        assert_eq!(got, frame);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let frames = vec![
            Frame::command(Command::Stats, Bytes::from_static(b"first")),
            Frame::status(Status::Ready, Bytes::from_static(b"second")),
            Frame::event(Event::TenantAdded, Bytes::from_static(b"third")),
        ];

        let mut combined = Vec::new();
        for frame in &frames {
            combined.extend_from_slice(&frame.encode());
        }

        let decoded = buffer.push(&combined).unwrap();
        assert_eq!(decoded.len(), 3);
        for (got, want) in decoded.into_iter().zip(frames) {
            assert_eq!(expect_frame(got), want);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::connected(
            Role::SERVER,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Bytes::from_static(b"cluster"),
        );
        let bytes = frame.encode();

        let mut all = Vec::new();
        for byte in bytes.iter() {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(expect_frame(all.into_iter().next().unwrap()), frame);
    }

    #[test]
    fn test_fragmented_payload_waits() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::command(Command::Start, Bytes::from_static(b"a longer payload"));
        let bytes = frame.encode();

        let decoded = buffer.push(&bytes[..bytes.len() - 4]).unwrap();
        assert!(decoded.is_empty());
        assert!(buffer.has_partial());

        let decoded = buffer.push(&bytes[bytes.len() - 4..]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(!buffer.has_partial());
    }

    #[test]
    fn test_unknown_operand_is_consumed_and_reported() {
        let mut buffer = FrameBuffer::new();

        // COMMAND with operand 0x42 and a 3-byte body.
        let mut bytes = vec![0, 1, 0x0, 0x42, 0, 0, 0, 3, b'x', b'y', b'z'];
        let follow = Frame::status(Status::Full, Bytes::new());
        bytes.extend_from_slice(&follow.encode());

        let decoded = buffer.push(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(
            decoded[0],
            Decoded::UnknownOperand {
                ty: FrameType::Command,
                operand: 0x42
            }
        ));
        assert_eq!(expect_frame(decoded.into_iter().nth(1).unwrap()), follow);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut buffer = FrameBuffer::new();
        let result = buffer.push(&[0, 1, 0x9, 0x0, 0, 0, 0, 0]);
        assert!(matches!(result, Err(SsntpError::InvalidFrame(_))));
    }

    #[test]
    fn test_max_payload_enforced() {
        let mut buffer = FrameBuffer::with_max_payload(16);
        let frame = Frame::command(Command::Start, Bytes::from(vec![0u8; 32]));
        let result = buffer.push(&frame.encode());
        assert!(matches!(result, Err(SsntpError::InvalidFrame(_))));
    }

    #[test]
    fn test_decoded_frame_keeps_wire_image() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::event(Event::PublicIpAssigned, Bytes::from_static(b"ip"));
        let bytes = frame.encode();

        let decoded = buffer.push(&bytes).unwrap();
        let got = expect_frame(decoded.into_iter().next().unwrap());
        assert_eq!(got.wire_image(), bytes);
    }
}

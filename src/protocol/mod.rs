//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the SSNTP binary frame codec:
//! - the closed frame taxonomy (type/operand codes)
//! - frame encoding and one-shot decoding
//! - a frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::{Decoded, FrameBuffer};
pub use wire_format::{
    Command, ErrorKind, Event, FrameKind, FrameType, KindFromCodes, Status,
    DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT, MAJOR, MINOR,
};

//! Frame-level tracing.
//!
//! When a [`TraceConfig`] is present in the endpoint configuration, every
//! sent and received frame is logged at debug level. [`FrameTrace`] is the
//! structured record an embedder can serialize into a TraceReport event
//! payload.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SsntpError};
use crate::protocol::Frame;

/// Frame tracing configuration.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Free-form label attached to every trace record, typically naming
    /// the workload or test run being traced.
    pub label: Option<String>,
}

/// Direction of a traced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Frame sent by this endpoint.
    Tx,
    /// Frame received by this endpoint.
    Rx,
}

/// One trace record, serializable as a TraceReport event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameTrace {
    /// Label from the trace configuration.
    pub label: Option<String>,
    /// UUID of the endpoint that recorded the trace.
    pub node: Uuid,
    /// Whether the frame was sent or received.
    pub direction: Direction,
    /// Frame type display name.
    pub frame_type: String,
    /// Operand display name.
    pub operand: String,
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl FrameTrace {
    /// Record a frame passing through an endpoint.
    pub fn record(config: &TraceConfig, node: Uuid, direction: Direction, frame: &Frame) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            label: config.label.clone(),
            node,
            direction,
            frame_type: frame.kind.frame_type().to_string(),
            operand: frame.kind.to_string(),
            payload_len: frame.payload.len(),
            timestamp_ms,
        }
    }

    /// Serialize into a TraceReport event payload.
    pub fn to_payload(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)
            .map_err(|e| SsntpError::InvalidFrame(format!("trace encode: {}", e)))?;
        Ok(Bytes::from(json))
    }

    /// Parse a TraceReport event payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| SsntpError::InvalidFrame(format!("trace decode: {}", e)))
    }
}

/// Log a frame if tracing is enabled.
pub(crate) fn trace_frame(
    config: &Option<TraceConfig>,
    node: Uuid,
    direction: Direction,
    frame: &Frame,
) {
    if let Some(config) = config {
        debug!(
            label = config.label.as_deref().unwrap_or(""),
            %node,
            ?direction,
            frame = %frame.kind,
            payload_len = frame.payload.len(),
            "ssntp frame"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn test_trace_payload_roundtrip() {
        let config = TraceConfig {
            label: Some(String::from("bench")),
        };
        let frame = Frame::command(Command::Stats, Bytes::from_static(b"stats"));
        let trace = FrameTrace::record(&config, Uuid::new_v4(), Direction::Tx, &frame);

        let payload = trace.to_payload().unwrap();
        let parsed = FrameTrace::from_payload(&payload).unwrap();

        assert_eq!(parsed.label.as_deref(), Some("bench"));
        assert_eq!(parsed.node, trace.node);
        assert_eq!(parsed.direction, Direction::Tx);
        assert_eq!(parsed.frame_type, "COMMAND");
        assert_eq!(parsed.payload_len, 5);
    }

    #[test]
    fn test_bad_payload_is_rejected() {
        assert!(FrameTrace::from_payload(b"not json").is_err());
    }
}

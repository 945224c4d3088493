//! Error types for the SSNTP crate.

use thiserror::Error;

use crate::role::Role;

/// Main error type for all SSNTP operations.
#[derive(Debug, Error)]
pub enum SsntpError {
    /// I/O error during socket or filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A frame could not be decoded (unknown type, bad operand, bad field).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A one-shot decode ran out of bytes before the frame was complete.
    #[error("truncated frame: {needed} more bytes needed")]
    Truncated {
        /// Number of additional bytes required to make progress.
        needed: usize,
    },

    /// The peer speaks an incompatible protocol major version.
    #[error("protocol version mismatch: peer is {major}.{minor}")]
    VersionMismatch {
        /// Peer major version.
        major: u8,
        /// Peer minor version.
        minor: u8,
    },

    /// The handshake sequence was violated (wrong first frame, repeated
    /// CONNECT, CONNECTED outside the handshake).
    #[error("handshake violation: {0}")]
    HandshakeViolation(String),

    /// The declared role is not covered by the certified role.
    #[error("role mismatch: declared {declared}, certified {certified}")]
    RoleMismatch {
        /// Role bitmask the peer declared.
        declared: Role,
        /// Role bitmask proved by the peer certificate.
        certified: Role,
    },

    /// A certificate could not be loaded, parsed, or carried no usable
    /// identity.
    #[error("invalid certificate: {0}")]
    CertificateInvalid(String),

    /// The connection is not usable (never established, already closed, or
    /// the transport failed underneath us).
    #[error("SSNTP connection failed")]
    ConnectionFailure,

    /// The connection was aborted, either by the peer or by policy.
    #[error("SSNTP connection aborted")]
    ConnectionAborted,

    /// The outbound queue for a peer is full.
    #[error("send queue overflow")]
    QueueOverflow,

    /// A read or write deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The endpoint is shutting down.
    #[error("shutting down")]
    Shutdown,

    /// Identity store failure (UUID persistence or locking).
    #[error("identity store: {0}")]
    Identity(String),
}

/// Result type alias using [`SsntpError`].
pub type Result<T> = std::result::Result<T, SsntpError>;

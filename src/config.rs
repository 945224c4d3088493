//! Endpoint configuration for SSNTP clients and servers.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::forward::ForwardRule;
use crate::protocol::DEFAULT_PORT;
use crate::role::Role;
use crate::trace::TraceConfig;

/// Default CA bundle location.
pub const DEFAULT_CA_CERT: &str = "/etc/pki/ssntp/ca_cert.crt";

/// Default endpoint certificate location.
pub const DEFAULT_CERT: &str = "/etc/pki/ssntp/cert.pem";

/// Default read deadline while a frame is in flight.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default write deadline per frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The underlying transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Reliable stream over IP.
    #[default]
    Tcp,
    /// Reliable stream over a local Unix socket.
    UnixSocket,
}

/// Configuration for an SSNTP client or server endpoint.
///
/// It is mandatory to provide a configuration when starting a server or
/// when connecting to one as a client.
#[derive(Debug, Clone)]
pub struct Config {
    /// The endpoint UUID. When unset, clients and servers derive a stable
    /// identity through the identity store.
    pub uuid: Option<Uuid>,

    /// URI semantics differ between servers and clients. For clients it is
    /// the server to connect to; for servers it is the address to listen
    /// on, with the empty string meaning all interfaces. For the Unix
    /// socket transport it is the socket path.
    pub uri: String,

    /// Bitmask of roles the endpoint intends to run.
    pub role: Role,

    /// Certification Authority bundle used to verify the peer identity.
    pub ca_cert: PathBuf,

    /// The endpoint's x509 signed certificate. The file may also carry the
    /// PEM private key, in which case `key` can stay unset.
    pub cert: PathBuf,

    /// Optional separate private key file. When unset the key is read from
    /// `cert`.
    pub key: Option<PathBuf>,

    /// The underlying transport.
    pub transport: TransportKind,

    /// Ordered frame forwarding rules, consulted by hubs before the
    /// built-in defaults.
    pub forward_rules: Vec<ForwardRule>,

    /// When true, the peer's declared role must be covered by the OIDs in
    /// its certificate's extended-key-usage extension.
    pub role_verification: bool,

    /// TCP port to connect to (client) or listen on (server). Servers may
    /// set 0 to bind an ephemeral port.
    pub port: u16,

    /// Frame-level tracing. When set, every sent and received frame is
    /// traced.
    pub trace: Option<TraceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uuid: None,
            uri: String::from("localhost"),
            role: Role::UNKNOWN,
            ca_cert: PathBuf::from(DEFAULT_CA_CERT),
            cert: PathBuf::from(DEFAULT_CERT),
            key: None,
            transport: TransportKind::Tcp,
            forward_rules: Vec::new(),
            role_verification: false,
            port: DEFAULT_PORT,
            trace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.role, Role::UNKNOWN);
        assert!(!config.role_verification);
        assert!(config.uuid.is_none());
        assert!(config.key.is_none());
    }
}

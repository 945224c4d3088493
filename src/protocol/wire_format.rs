//! Wire format constants and the closed frame taxonomy.
//!
//! Every SSNTP frame starts with a 4-byte prelude:
//! ```text
//! ┌────────┬────────┬────────┬─────────┐
//! │ Major  │ Minor  │ Type   │ Operand │
//! │ 1 byte │ 1 byte │ 1 byte │ 1 byte  │
//! └────────┴────────┴────────┴─────────┘
//! ```
//! followed by type/operand-dependent fields (role bitmask on CONNECT and
//! CONNECTED, peer UUIDs on CONNECTED), a 4-byte big-endian payload length
//! and the payload itself. All multi-byte integers are big endian.
//!
//! The (type, operand) pair forms a closed set. [`FrameKind::from_codes`]
//! is the single entry point from wire codes and distinguishes an unknown
//! frame type (fatal, the rest of the stream cannot be parsed) from a known
//! type with an out-of-range operand (recoverable, the frame body can still
//! be skipped).

use std::fmt;

/// Protocol major version. A peer with a different major version fails the
/// handshake.
pub const MAJOR: u8 = 0;

/// Protocol minor version.
pub const MINOR: u8 = 1;

/// Size of the fixed frame prelude: major, minor, type, operand.
pub const PRELUDE_SIZE: usize = 4;

/// Size of the role bitmask field carried by CONNECT and CONNECTED.
pub const ROLE_SIZE: usize = 4;

/// Size of one UUID field on the wire.
pub const UUID_SIZE: usize = 16;

/// Size of the payload length field.
pub const PAYLOAD_LEN_SIZE: usize = 4;

/// Default maximum accepted payload size (16 MiB). The length field itself
/// allows 4 GiB; the cap keeps a hostile length from exhausting memory.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Default SSNTP port.
pub const DEFAULT_PORT: u16 = 8888;

/// SSNTP frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Commands sent by SSNTP clients, e.g. START or STOP for workloads.
    /// SSNTP is asynchronous; commands are not replied to.
    Command = 0x0,
    /// Node status reports, used by the scheduler for its decisions.
    Status = 0x1,
    /// Error reports, typically for command failures.
    Error = 0x2,
    /// Asynchronous cluster events the receiver may broadcast.
    Event = 0x3,
}

impl FrameType {
    /// Map a wire code to a frame type.
    pub fn from_code(code: u8) -> Option<FrameType> {
        match code {
            0x0 => Some(FrameType::Command),
            0x1 => Some(FrameType::Status),
            0x2 => Some(FrameType::Error),
            0x3 => Some(FrameType::Event),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Command => "COMMAND",
            FrameType::Status => "STATUS",
            FrameType::Error => "ERROR",
            FrameType::Event => "EVENT",
        };
        f.write_str(name)
    }
}

/// COMMAND operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// First frame sent by a client to establish the SSNTP connection.
    /// Carries the client role bitmask.
    Connect = 0x0,
    /// Schedule a new workload on a compute node.
    Start = 0x1,
    /// Stop a running workload.
    Stop = 0x2,
    /// Compute node statistics update.
    Stats = 0x3,
    /// Ask an agent to evacuate its compute node.
    Evacuate = 0x4,
    /// Delete a stopped persistent workload.
    Delete = 0x5,
    /// Restart a stopped persistent workload.
    Restart = 0x6,
    /// Assign a publicly routable IP to an instance, relayed to the
    /// addressed concentrator agent.
    AssignPublicIp = 0x7,
    /// Release a public IP back to the pool, relayed to the addressed
    /// concentrator agent.
    ReleasePublicIp = 0x8,
    /// Full cluster configuration push. The payload always carries the
    /// complete configuration, never a delta.
    Configure = 0x9,
}

impl Command {
    /// Map a wire operand to a command.
    pub fn from_code(code: u8) -> Option<Command> {
        match code {
            0x0 => Some(Command::Connect),
            0x1 => Some(Command::Start),
            0x2 => Some(Command::Stop),
            0x3 => Some(Command::Stats),
            0x4 => Some(Command::Evacuate),
            0x5 => Some(Command::Delete),
            0x6 => Some(Command::Restart),
            0x7 => Some(Command::AssignPublicIp),
            0x8 => Some(Command::ReleasePublicIp),
            0x9 => Some(Command::Configure),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Connect => "CONNECT",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Stats => "STATISTICS",
            Command::Evacuate => "EVACUATE",
            Command::Delete => "DELETE",
            Command::Restart => "RESTART",
            Command::AssignPublicIp => "Assign public IP",
            Command::ReleasePublicIp => "Release public IP",
            Command::Configure => "CONFIGURE",
        };
        f.write_str(name)
    }
}

/// STATUS operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Server reply to CONNECT, completing the handshake. Carries the
    /// server role bitmask, both peer UUIDs and the cluster configuration.
    Connected = 0x0,
    /// The node has capacity for more work.
    Ready = 0x1,
    /// The node is temporarily running at full capacity.
    Full = 0x2,
    /// The node is connected but not accepting any commands.
    Offline = 0x3,
    /// The node entered maintenance mode.
    Maintenance = 0x4,
}

impl Status {
    /// Map a wire operand to a status.
    pub fn from_code(code: u8) -> Option<Status> {
        match code {
            0x0 => Some(Status::Connected),
            0x1 => Some(Status::Ready),
            0x2 => Some(Status::Full),
            0x3 => Some(Status::Offline),
            0x4 => Some(Status::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Connected => "CONNECTED",
            Status::Ready => "READY",
            Status::Full => "FULL",
            Status::Offline => "OFFLINE",
            Status::Maintenance => "MAINTENANCE",
        };
        f.write_str(name)
    }
}

/// ERROR operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Received an unsupported frame type or operand.
    InvalidFrameType = 0x0,
    /// A workload start failed.
    StartFailure = 0x1,
    /// A workload stop failed.
    StopFailure = 0x2,
    /// The SSNTP connection failed.
    ConnectionFailure = 0x3,
    /// A workload restart failed.
    RestartFailure = 0x4,
    /// A workload deletion failed.
    DeleteFailure = 0x5,
    /// The SSNTP connection was aborted, e.g. on bad certificates.
    ConnectionAborted = 0x6,
    /// A CONFIGURE payload could not be applied. The hub reverts to the
    /// previous configuration when it receives this.
    InvalidConfiguration = 0x7,
}

impl ErrorKind {
    /// Map a wire operand to an error kind.
    pub fn from_code(code: u8) -> Option<ErrorKind> {
        match code {
            0x0 => Some(ErrorKind::InvalidFrameType),
            0x1 => Some(ErrorKind::StartFailure),
            0x2 => Some(ErrorKind::StopFailure),
            0x3 => Some(ErrorKind::ConnectionFailure),
            0x4 => Some(ErrorKind::RestartFailure),
            0x5 => Some(ErrorKind::DeleteFailure),
            0x6 => Some(ErrorKind::ConnectionAborted),
            0x7 => Some(ErrorKind::InvalidConfiguration),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidFrameType => "Invalid SSNTP frame type",
            ErrorKind::StartFailure => "Could not start instance",
            ErrorKind::StopFailure => "Could not stop instance",
            ErrorKind::ConnectionFailure => "SSNTP Connection failed",
            ErrorKind::RestartFailure => "Could not restart instance",
            ErrorKind::DeleteFailure => "Could not delete instance",
            ErrorKind::ConnectionAborted => "SSNTP Connection aborted",
            ErrorKind::InvalidConfiguration => "Cluster configuration is invalid",
        };
        f.write_str(name)
    }
}

/// EVENT operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    /// First workload for a tenant started on a node.
    TenantAdded = 0x0,
    /// Last workload for a tenant terminated on a node.
    TenantRemoved = 0x1,
    /// A previously running instance was deleted.
    InstanceDeleted = 0x2,
    /// A networking concentrator instance is now running.
    ConcentratorInstanceAdded = 0x3,
    /// A concentrator assigned a public IP to an instance.
    PublicIpAssigned = 0x4,
    /// A frame tracing report.
    TraceReport = 0x5,
    /// A node joined the SSNTP network.
    NodeConnected = 0x6,
    /// A node left the SSNTP network.
    NodeDisconnected = 0x7,
}

impl Event {
    /// Map a wire operand to an event.
    pub fn from_code(code: u8) -> Option<Event> {
        match code {
            0x0 => Some(Event::TenantAdded),
            0x1 => Some(Event::TenantRemoved),
            0x2 => Some(Event::InstanceDeleted),
            0x3 => Some(Event::ConcentratorInstanceAdded),
            0x4 => Some(Event::PublicIpAssigned),
            0x5 => Some(Event::TraceReport),
            0x6 => Some(Event::NodeConnected),
            0x7 => Some(Event::NodeDisconnected),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::TenantAdded => "Tenant Added",
            Event::TenantRemoved => "Tenant Removed",
            Event::InstanceDeleted => "Instance Deleted",
            Event::ConcentratorInstanceAdded => "Network Concentrator Instance Added",
            Event::PublicIpAssigned => "Public IP Assigned",
            Event::TraceReport => "Trace Report",
            Event::NodeConnected => "Node Connected",
            Event::NodeDisconnected => "Node Disconnected",
        };
        f.write_str(name)
    }
}

/// The closed (type, operand) union carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A COMMAND frame.
    Command(Command),
    /// A STATUS frame.
    Status(Status),
    /// An ERROR frame.
    Error(ErrorKind),
    /// An EVENT frame.
    Event(Event),
}

/// Outcome of mapping wire codes through the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFromCodes {
    /// The pair is in the closed set.
    Known(FrameKind),
    /// The type is known but the operand is out of range. The frame body
    /// still has the generic shape and can be skipped.
    UnknownOperand {
        /// The recognized frame type.
        ty: FrameType,
        /// The out-of-range operand code.
        operand: u8,
    },
    /// The type code itself is unknown; nothing further can be parsed.
    UnknownType {
        /// The unrecognized type code.
        code: u8,
    },
}

impl FrameKind {
    /// Classify a wire (type, operand) pair.
    pub fn from_codes(ty: u8, operand: u8) -> KindFromCodes {
        let ty = match FrameType::from_code(ty) {
            Some(ty) => ty,
            None => return KindFromCodes::UnknownType { code: ty },
        };

        let kind = match ty {
            FrameType::Command => Command::from_code(operand).map(FrameKind::Command),
            FrameType::Status => Status::from_code(operand).map(FrameKind::Status),
            FrameType::Error => ErrorKind::from_code(operand).map(FrameKind::Error),
            FrameType::Event => Event::from_code(operand).map(FrameKind::Event),
        };

        match kind {
            Some(kind) => KindFromCodes::Known(kind),
            None => KindFromCodes::UnknownOperand { ty, operand },
        }
    }

    /// The frame type of this kind.
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameKind::Command(_) => FrameType::Command,
            FrameKind::Status(_) => FrameType::Status,
            FrameKind::Error(_) => FrameType::Error,
            FrameKind::Event(_) => FrameType::Event,
        }
    }

    /// The wire code of the frame type.
    pub fn type_code(&self) -> u8 {
        self.frame_type() as u8
    }

    /// The wire code of the operand.
    pub fn operand_code(&self) -> u8 {
        match self {
            FrameKind::Command(op) => *op as u8,
            FrameKind::Status(op) => *op as u8,
            FrameKind::Error(op) => *op as u8,
            FrameKind::Event(op) => *op as u8,
        }
    }

    /// Whether this is the CONNECT command.
    pub fn is_connect(&self) -> bool {
        matches!(self, FrameKind::Command(Command::Connect))
    }

    /// Whether this is the CONNECTED status.
    pub fn is_connected(&self) -> bool {
        matches!(self, FrameKind::Status(Status::Connected))
    }

    /// Whether frames of this kind carry a role bitmask field.
    pub fn carries_role(&self) -> bool {
        self.is_connect() || self.is_connected()
    }

    /// Whether frames of this kind carry the server and client UUID fields.
    pub fn carries_uuids(&self) -> bool {
        self.is_connected()
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Command(op) => write!(f, "{} {}", self.frame_type(), op),
            FrameKind::Status(op) => write!(f, "{} {}", self.frame_type(), op),
            FrameKind::Error(op) => write!(f, "{} {}", self.frame_type(), op),
            FrameKind::Event(op) => write!(f, "{} {}", self.frame_type(), op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_are_normative() {
        assert_eq!(FrameType::Command as u8, 0x0);
        assert_eq!(FrameType::Status as u8, 0x1);
        assert_eq!(FrameType::Error as u8, 0x2);
        assert_eq!(FrameType::Event as u8, 0x3);
    }

    #[test]
    fn test_operand_codes_are_normative() {
        assert_eq!(Command::Configure as u8, 0x9);
        assert_eq!(Status::Maintenance as u8, 0x4);
        assert_eq!(ErrorKind::InvalidConfiguration as u8, 0x7);
        assert_eq!(Event::NodeDisconnected as u8, 0x7);
    }

    #[test]
    fn test_closed_set_roundtrip() {
        for ty in 0u8..4 {
            for op in 0u8..16 {
                match FrameKind::from_codes(ty, op) {
                    KindFromCodes::Known(kind) => {
                        assert_eq!(kind.type_code(), ty);
                        assert_eq!(kind.operand_code(), op);
                    }
                    KindFromCodes::UnknownOperand { ty: t, operand } => {
                        assert_eq!(t as u8, ty);
                        assert_eq!(operand, op);
                    }
                    KindFromCodes::UnknownType { .. } => panic!("type {} is defined", ty),
                }
            }
        }
    }

    #[test]
    fn test_operand_ranges() {
        assert!(matches!(
            FrameKind::from_codes(0x0, 0x9),
            KindFromCodes::Known(FrameKind::Command(Command::Configure))
        ));
        assert!(matches!(
            FrameKind::from_codes(0x0, 0xa),
            KindFromCodes::UnknownOperand { .. }
        ));
        assert!(matches!(
            FrameKind::from_codes(0x1, 0x5),
            KindFromCodes::UnknownOperand { .. }
        ));
        assert!(matches!(
            FrameKind::from_codes(0x2, 0x8),
            KindFromCodes::UnknownOperand { .. }
        ));
        assert!(matches!(
            FrameKind::from_codes(0x3, 0x8),
            KindFromCodes::UnknownOperand { .. }
        ));
        assert!(matches!(
            FrameKind::from_codes(0x4, 0x0),
            KindFromCodes::UnknownType { code: 0x4 }
        ));
    }

    #[test]
    fn test_field_presence() {
        assert!(FrameKind::Command(Command::Connect).carries_role());
        assert!(!FrameKind::Command(Command::Connect).carries_uuids());
        assert!(FrameKind::Status(Status::Connected).carries_role());
        assert!(FrameKind::Status(Status::Connected).carries_uuids());
        assert!(!FrameKind::Command(Command::Start).carries_role());
        assert!(!FrameKind::Event(Event::TraceReport).carries_role());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(Command::Stats.to_string(), "STATISTICS");
        assert_eq!(Command::AssignPublicIp.to_string(), "Assign public IP");
        assert_eq!(ErrorKind::ConnectionAborted.to_string(), "SSNTP Connection aborted");
        assert_eq!(
            Event::ConcentratorInstanceAdded.to_string(),
            "Network Concentrator Instance Added"
        );
        assert_eq!(
            FrameKind::Status(Status::Connected).to_string(),
            "STATUS CONNECTED"
        );
    }
}

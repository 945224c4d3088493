//! SSNTP roles and their certificate OID bindings.
//!
//! A peer declares one or several roles when it connects, as a 32-bit
//! bitmask. Each role bit maps to an ASN.1 object identifier under
//! `1.3.6.1.4.1.343.8` which is expected to appear in the peer
//! certificate's extended-key-usage extension. Role verification checks
//! that a declared role bitmask is covered by the OIDs the certificate
//! actually carries.

use std::fmt;
use std::str::FromStr;

use crate::error::SsntpError;

/// A bitmask of SSNTP roles held by a client or server.
///
/// A single peer may hold several roles simultaneously, e.g. a main server
/// typically runs as `SERVER | SCHEDULER`. Subsumption is bitwise subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Role(u32);

impl Role {
    /// No role. Peers declaring this are rejected during the handshake.
    pub const UNKNOWN: Role = Role(0x0);
    /// The main SSNTP server.
    pub const SERVER: Role = Role(0x1);
    /// The command and status reporter. This is a client role.
    pub const CONTROLLER: Role = Role(0x2);
    /// The compute node agent. This is a client role.
    pub const AGENT: Role = Role(0x4);
    /// The workload scheduler. This is a server role.
    pub const SCHEDULER: Role = Role(0x8);
    /// The networking compute node agent. This is a client role.
    pub const NETAGENT: Role = Role(0x10);
    /// The networking concentrator instance (CNCI) agent. This is a client role.
    pub const CNCIAGENT: Role = Role(0x20);

    /// All defined role bits.
    const ALL: u32 = 0x3f;

    /// Build a role from a raw 32-bit mask. Undefined bits are preserved;
    /// they simply never match any OID.
    pub const fn from_bits(bits: u32) -> Role {
        Role(bits)
    }

    /// The raw 32-bit mask.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether no role bit is set.
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is also set in `self`.
    pub const fn contains(self, other: Role) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share at least one bit.
    pub const fn intersects(self, other: Role) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether this mask names a server-side endpoint.
    pub const fn is_server(self) -> bool {
        self.0 & (Self::SERVER.0 | Self::SCHEDULER.0) != 0
    }

    /// The dotted-decimal OIDs proving each bit of this role, in bit order.
    ///
    /// Fails for a mask with no defined bits set, since such a role cannot
    /// be certified.
    pub fn to_oids(self) -> Result<Vec<&'static str>, SsntpError> {
        let oids: Vec<&'static str> = ROLE_OID_TABLE
            .iter()
            .filter(|(role, _)| self.contains(*role))
            .map(|(_, oid)| *oid)
            .collect();

        if oids.is_empty() {
            return Err(SsntpError::CertificateInvalid(format!(
                "no OID for role {:#x}",
                self.0
            )));
        }

        Ok(oids)
    }

    /// Fold a set of dotted-decimal OIDs back into a role mask.
    ///
    /// OIDs outside the role table are ignored, so this is usable directly
    /// on a certificate's full unknown extended-key-usage list.
    pub fn from_oids<I, S>(oids: I) -> Role
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut role = Role::UNKNOWN;
        for oid in oids {
            for (bit, known) in ROLE_OID_TABLE {
                if oid.as_ref() == *known {
                    role = role | *bit;
                }
            }
        }
        role
    }
}

impl std::ops::BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        Role(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Role {
    fn bitor_assign(&mut self, rhs: Role) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Role {
    type Output = Role;

    fn bitand(self, rhs: Role) -> Role {
        Role(self.0 & rhs.0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Role::SERVER) {
            write!(f, "Server-")?;
        }
        if self.contains(Role::CONTROLLER) {
            write!(f, "Controller-")?;
        }
        if self.contains(Role::AGENT) {
            write!(f, "CNAgent-")?;
        }
        if self.contains(Role::SCHEDULER) {
            write!(f, "Scheduler-")?;
        }
        if self.contains(Role::NETAGENT) {
            write!(f, "NetworkingAgent-")?;
        }
        if self.contains(Role::CNCIAGENT) {
            write!(f, "CNCIAgent-")?;
        }
        Ok(())
    }
}

impl FromStr for Role {
    type Err = SsntpError;

    /// Parse a comma-separated role list, e.g. `"server,scheduler"`.
    fn from_str(value: &str) -> Result<Role, SsntpError> {
        let mut role = Role::UNKNOWN;
        for name in value.split(',') {
            role |= match name.trim() {
                "unknown" => Role::UNKNOWN,
                "server" => Role::SERVER,
                "controller" => Role::CONTROLLER,
                "agent" => Role::AGENT,
                "scheduler" => Role::SCHEDULER,
                "netagent" => Role::NETAGENT,
                "cnciagent" => Role::CNCIAGENT,
                other => {
                    return Err(SsntpError::InvalidFrame(format!("unknown role {:?}", other)));
                }
            };
        }
        Ok(role)
    }
}

/// Role bit to extended-key-usage OID, under the 1.3.6.1.4.1.343.8 arc.
const ROLE_OID_TABLE: &[(Role, &str)] = &[
    (Role::AGENT, "1.3.6.1.4.1.343.8.1"),
    (Role::SCHEDULER, "1.3.6.1.4.1.343.8.2"),
    (Role::CONTROLLER, "1.3.6.1.4.1.343.8.3"),
    (Role::NETAGENT, "1.3.6.1.4.1.343.8.4"),
    (Role::SERVER, "1.3.6.1.4.1.343.8.5"),
    (Role::CNCIAGENT, "1.3.6.1.4.1.343.8.6"),
];

/// The OID components shared by every role OID, used when minting
/// certificates: `1.3.6.1.4.1.343.8`.
pub const ROLE_OID_ARC: &[u64] = &[1, 3, 6, 1, 4, 1, 343, 8];

/// The arc suffix for each role bit, in the same order as
/// [`Role::to_oids`]. Exposed for certificate tooling.
pub fn role_oid_components(role: Role) -> Vec<Vec<u64>> {
    let mut out = Vec::new();
    for (bit, oid) in ROLE_OID_TABLE {
        if role.contains(*bit) {
            let components = oid
                .split('.')
                .map(|part| part.parse::<u64>().expect("static OID table is numeric"))
                .collect();
            out.push(components);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsumption() {
        let server = Role::SERVER | Role::SCHEDULER;
        assert!(server.contains(Role::SERVER));
        assert!(server.contains(Role::SCHEDULER));
        assert!(!server.contains(Role::AGENT));
        assert!(server.contains(server));
        assert!(Role::AGENT.contains(Role::UNKNOWN));
    }

    #[test]
    fn test_oid_roundtrip_all_masks() {
        // Every representable union of defined bits survives the OID trip.
        for bits in 1..=Role::ALL {
            let role = Role::from_bits(bits);
            let oids = role.to_oids().unwrap();
            assert_eq!(Role::from_oids(oids), role, "mask {:#x}", bits);
        }
    }

    #[test]
    fn test_from_oids_ignores_foreign_oids() {
        let role = Role::from_oids(["1.2.3.4", "1.3.6.1.4.1.343.8.3", "2.5.29.15"]);
        assert_eq!(role, Role::CONTROLLER);
    }

    #[test]
    fn test_unknown_role_has_no_oids() {
        assert!(Role::UNKNOWN.to_oids().is_err());
    }

    #[test]
    fn test_parse_role_list() {
        let role: Role = "server,scheduler".parse().unwrap();
        assert_eq!(role, Role::SERVER | Role::SCHEDULER);

        let role: Role = "controller".parse().unwrap();
        assert_eq!(role, Role::CONTROLLER);

        assert!("launcher".parse::<Role>().is_err());
    }

    #[test]
    fn test_display() {
        let role = Role::SERVER | Role::SCHEDULER;
        assert_eq!(role.to_string(), "Server-Scheduler-");
        assert_eq!(Role::CNCIAGENT.to_string(), "CNCIAgent-");
        assert_eq!(Role::UNKNOWN.to_string(), "");
    }

    #[test]
    fn test_oid_components_match_table() {
        let comps = role_oid_components(Role::AGENT);
        assert_eq!(comps, vec![vec![1, 3, 6, 1, 4, 1, 343, 8, 1]]);
    }
}

//! Core types shared by every spillway crate.
//!
//! - [`Domain`]: which of the two RPC contexts a call travels on
//! - [`Protocol`]: transport protocol names, in the `family+provider` form
//! - [`OpId`]: transport-level operation identifier derived from a name
//! - [`ClientKey`]: identity of one client process attached to a server
//! - [`JobInfo`]: this server's rank and the job size

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the two RPC transport contexts a server runs.
///
/// Local traffic comes from clients co-located on the node; remote traffic
/// comes from the other servers of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Shared-memory, client-facing.
    Local,
    /// Network, server-facing.
    Remote,
}

impl Domain {
    /// Short stable name used in store keys and log fields.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Domain::Local => "local",
            Domain::Remote => "remote",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocols a fabric may be asked to initialize.
///
/// Addresses produced by a fabric are prefixed with the protocol name
/// (`ofi+tcp://10.0.0.1:4500`), so an address string always names the
/// protocol it must be resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Intra-node shared memory (`na+sm`).
    SharedMemory,
    /// RDMA-capable fabric addressing (`ofi+verbs`).
    OfiVerbs,
    /// TCP fabric addressing (`ofi+tcp`).
    OfiTcp,
    /// Socket-provider fabric addressing (`ofi+sockets`).
    OfiSockets,
    /// Legacy BMI over TCP (`bmi+tcp`).
    BmiTcp,
}

impl Protocol {
    /// Every protocol, in declaration order.
    pub const ALL: [Protocol; 5] = [
        Protocol::SharedMemory,
        Protocol::OfiVerbs,
        Protocol::OfiTcp,
        Protocol::OfiSockets,
        Protocol::BmiTcp,
    ];

    /// Protocol name as it appears in address strings.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::SharedMemory => "na+sm",
            Protocol::OfiVerbs => "ofi+verbs",
            Protocol::OfiTcp => "ofi+tcp",
            Protocol::OfiSockets => "ofi+sockets",
            Protocol::BmiTcp => "bmi+tcp",
        }
    }

    /// Whether the protocol moves bytes over plain sockets.
    pub const fn is_socket_based(&self) -> bool {
        matches!(
            self,
            Protocol::OfiTcp | Protocol::OfiSockets | Protocol::BmiTcp
        )
    }

    /// Split an address string into its protocol and the remainder.
    ///
    /// Returns `None` when the string has no `proto://` prefix or the
    /// prefix is not a known protocol.
    pub fn split_address(address: &str) -> Option<(Protocol, &str)> {
        let (proto, rest) = address.split_once("://")?;
        let protocol = proto.parse().ok()?;
        Some((protocol, rest))
    }

    /// Build an address string for this protocol.
    pub fn address(&self, location: impl std::fmt::Display) -> String {
        format!("{}://{}", self.as_str(), location)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a protocol name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

/// Transport-level operation identifier.
///
/// Derived from the operation name with CRC32C so that every process
/// registering the same name computes the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl OpId {
    /// Identifier for an operation name.
    pub fn from_name(name: &str) -> Self {
        OpId(crc32c::crc32c(name.as_bytes()))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Identity of one client process attached to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    /// Application the client belongs to.
    pub app_id: i32,
    /// Client index within the application.
    pub client_id: i32,
}

impl ClientKey {
    /// Create a client key.
    pub const fn new(app_id: i32, client_id: i32) -> Self {
        Self { app_id, client_id }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.app_id, self.client_id)
    }
}

/// Placement of this server within the job.
///
/// Ranks are dense (`0..size`) and known to every server before startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// This server's rank.
    pub rank: usize,
    /// Number of servers in the job.
    pub size: usize,
}

impl JobInfo {
    /// Create job info; `rank` must be below `size`.
    pub fn new(rank: usize, size: usize) -> Option<Self> {
        (rank < size).then_some(Self { rank, size })
    }

    /// Iterate over every rank of the job in ascending order.
    pub fn ranks(&self) -> std::ops::Range<usize> {
        0..self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_roundtrip() {
        for protocol in Protocol::ALL {
            let parsed: Protocol = protocol.as_str().parse().expect("known protocol");
            assert_eq!(parsed, protocol);
        }
        assert!("ucx+rc".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_split_address() {
        let (protocol, rest) =
            Protocol::split_address("ofi+tcp://10.0.0.1:4500").expect("valid address");
        assert_eq!(protocol, Protocol::OfiTcp);
        assert_eq!(rest, "10.0.0.1:4500");

        assert!(Protocol::split_address("10.0.0.1:4500").is_none());
        assert!(Protocol::split_address("foo+bar://x").is_none());
    }

    #[test]
    fn test_socket_based() {
        assert!(Protocol::OfiTcp.is_socket_based());
        assert!(Protocol::BmiTcp.is_socket_based());
        assert!(!Protocol::SharedMemory.is_socket_based());
        assert!(!Protocol::OfiVerbs.is_socket_based());
    }

    #[test]
    fn test_op_id_is_stable_per_name() {
        let a = OpId::from_name("spillway_heartbeat_rpc");
        let b = OpId::from_name("spillway_heartbeat_rpc");
        let c = OpId::from_name("spillway_mount_rpc");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_job_info_rejects_out_of_range_rank() {
        assert!(JobInfo::new(3, 3).is_none());
        let job = JobInfo::new(2, 3).expect("valid job");
        assert_eq!(job.ranks().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_client_key_display() {
        assert_eq!(ClientKey::new(4, 17).to_string(), "[4:17]");
    }
}

//! Error taxonomy for the spillway RPC substrate.
//!
//! Startup kinds ([`RpcError::TransportUnavailable`],
//! [`RpcError::AddressResolution`], [`RpcError::DuplicateRegistration`],
//! [`RpcError::Init`]) abort initialization. Steady-state kinds are returned
//! to the caller, which decides whether to retry, log, or escalate.

use std::time::Duration;

use thiserror::Error;

use crate::{ClientKey, Domain, OpId, Protocol};

/// Errors produced by the cluster key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyValError {
    /// The store could not be reached or refused the operation.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// A barrier was entered on a scope the store does not know.
    #[error("barrier failed for scope {scope}: {reason}")]
    Barrier {
        /// Barrier scope.
        scope: String,
        /// Why the barrier failed.
        reason: String,
    },
}

/// Errors returned by every spillway RPC operation.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No candidate transport protocol initialized.
    #[error("no transport available for {domain} domain (tried: {})", protocol_list(.tried))]
    TransportUnavailable {
        /// Domain being opened.
        domain: Domain,
        /// Protocols attempted, in order.
        tried: Vec<Protocol>,
    },

    /// The endpoint could not produce its own address.
    #[error("{domain} endpoint cannot resolve its own address: {reason}")]
    AddressResolution {
        /// Domain of the endpoint.
        domain: Domain,
        /// Transport-reported reason.
        reason: String,
    },

    /// The same operation name was registered twice on one endpoint.
    #[error("operation {name} already registered on {domain} endpoint")]
    DuplicateRegistration {
        /// Domain of the endpoint.
        domain: Domain,
        /// Operation name.
        name: String,
    },

    /// Two distinct operation names map to the same identifier.
    #[error("operation {name} collides with {existing} on identifier {id}")]
    OperationIdCollision {
        /// Name being registered.
        name: String,
        /// Name already holding the identifier.
        existing: String,
        /// The shared identifier.
        id: OpId,
    },

    /// An operation name was used without being registered.
    #[error("operation {name} is not registered on {domain} endpoint")]
    UnknownOperation {
        /// Domain of the endpoint.
        domain: Domain,
        /// Operation name.
        name: String,
    },

    /// The peer has not published an address for the domain.
    #[error("rank {rank} has not published a {domain} address")]
    AddressNotPublished {
        /// Domain looked up.
        domain: Domain,
        /// Peer rank.
        rank: usize,
    },

    /// The peer's address could not be resolved into a connection.
    #[error("failed to resolve {domain} address {address} of rank {rank}: {reason}")]
    ResolutionFailed {
        /// Domain of the endpoint used.
        domain: Domain,
        /// Peer rank.
        rank: usize,
        /// Address that failed to resolve.
        address: String,
        /// Transport-reported reason.
        reason: String,
    },

    /// Eager policy in effect and the peer was never connected.
    #[error("rank {rank} is not connected")]
    PeerNotConnected {
        /// Peer rank.
        rank: usize,
    },

    /// A rank outside `0..size` was requested.
    #[error("rank {rank} out of range for job of size {size}")]
    InvalidRank {
        /// Requested rank.
        rank: usize,
        /// Job size.
        size: usize,
    },

    /// The client registry does not know the client, or its address
    /// cannot be resolved.
    #[error("client {key} not found")]
    ClientNotFound {
        /// Client identity.
        key: ClientKey,
    },

    /// The call did not complete within its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation name.
        operation: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The call failed at the transport layer; the remote handler result
    /// is unknown.
    #[error("{operation} failed in transport: {reason}")]
    Transport {
        /// Operation name.
        operation: String,
        /// Transport-reported reason.
        reason: String,
    },

    /// Bulk region registration failed.
    #[error("bulk region of {size} bytes could not be exposed: {reason}")]
    Bulk {
        /// Region size in bytes.
        size: usize,
        /// Transport-reported reason.
        reason: String,
    },

    /// The configuration holds a value the substrate cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// RPC initialization failed; no endpoint was left open.
    #[error("rpc initialization failed: {0}")]
    Init(#[source] Box<RpcError>),

    /// Cluster store failure.
    #[error("key-value store: {0}")]
    KeyVal(#[from] KeyValError),

    /// Payload could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),

    /// The context stopped accepting new calls.
    #[error("rpc context is shutting down")]
    ShuttingDown,
}

impl RpcError {
    /// Whether a caller may reasonably retry or continue after this error.
    ///
    /// Startup and programming errors are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RpcError::TransportUnavailable { .. }
            | RpcError::AddressResolution { .. }
            | RpcError::DuplicateRegistration { .. }
            | RpcError::OperationIdCollision { .. }
            | RpcError::UnknownOperation { .. }
            | RpcError::InvalidRank { .. }
            | RpcError::InvalidConfig(_)
            | RpcError::Init(_)
            | RpcError::ShuttingDown => false,
            RpcError::AddressNotPublished { .. }
            | RpcError::ResolutionFailed { .. }
            | RpcError::PeerNotConnected { .. }
            | RpcError::ClientNotFound { .. }
            | RpcError::Timeout { .. }
            | RpcError::Transport { .. }
            | RpcError::Bulk { .. }
            | RpcError::KeyVal(_)
            | RpcError::Codec(_) => true,
        }
    }
}

impl From<crate::CodecError> for RpcError {
    fn from(err: crate::CodecError) -> Self {
        RpcError::Codec(err.to_string())
    }
}

fn protocol_list(protocols: &[Protocol]) -> String {
    protocols
        .iter()
        .map(Protocol::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result alias for spillway operations.
pub type RpcResult<T> = Result<T, RpcError>;

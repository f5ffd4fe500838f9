//! # spillway-transport
//!
//! Endpoints and transport fabrics for spillway.
//!
//! - [`Endpoint`]: one RPC context per domain, opened with protocol
//!   fallback, with its own [`OperationTable`]
//! - [`Connection`]: a resolved peer or client address
//! - [`BulkRegion`]: a zero-copy region scoped to one call
//! - [`fabric`]: the plugin traits and the memory and TCP fabrics
//! - [`wire`]: checksummed frames used by socket fabrics

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod endpoint;
pub mod fabric;
mod op_table;
pub mod wire;

pub use endpoint::{BulkRegion, Connection, Endpoint, PendingCall};
pub use fabric::{
    handler_fn, BulkDescriptor, Fabric, FabricError, FabricInstance, HandlerError, IncomingCall,
    InitOptions, MemoryFabric, MemoryFabricStats, OutboundCall, ProgressMode, RemoteTarget,
    RpcHandler, TcpFabric,
};
pub use op_table::OperationTable;

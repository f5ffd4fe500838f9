//! Fabric plugins: the byte movers underneath an [`Endpoint`](crate::Endpoint).
//!
//! A [`Fabric`] initializes one [`FabricInstance`] per endpoint for a given
//! [`Protocol`]. The instance listens, resolves peer address strings into
//! [`RemoteTarget`]s, dispatches incoming calls to registered
//! [`RpcHandler`]s, and manages bulk regions.
//!
//! Two fabrics ship with the crate:
//!
//! - [`MemoryFabric`]: in-process hub, used for the shared-memory domain of
//!   co-located processes and for deterministic multi-rank tests
//! - [`TcpFabric`]: socket-based protocols over tokio TCP streams

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spillway_core::{OpId, Protocol};
use thiserror::Error;

use crate::wire::WireError;

mod memory;
mod tcp;

pub use memory::{MemoryFabric, MemoryFabricStats};
pub use tcp::TcpFabric;

/// How a fabric instance makes progress on incoming work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// A background thread owned by the instance drives progress.
    #[default]
    Dedicated,
    /// Progress is driven by the caller's runtime.
    Caller,
}

/// Options passed to [`Fabric::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    /// Progress model.
    pub progress: ProgressMode,
    /// Worker pool size for incoming handlers.
    pub pool_size: usize,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            progress: ProgressMode::Dedicated,
            pool_size: 4,
        }
    }
}

/// Errors reported by fabric plugins.
#[derive(Debug, Clone, Error)]
pub enum FabricError {
    /// The fabric does not implement this protocol.
    #[error("protocol {0} not supported by this fabric")]
    Unsupported(Protocol),

    /// The protocol is implemented but failed to initialize.
    #[error("{protocol} failed to initialize: {reason}")]
    InitFailed {
        /// Protocol being initialized.
        protocol: Protocol,
        /// Why initialization failed.
        reason: String,
    },

    /// The instance cannot describe its own address.
    #[error("no self address: {0}")]
    NoSelfAddress(String),

    /// Nothing is listening at the address.
    #[error("unknown address {0}")]
    UnknownAddress(String),

    /// The address exists but cannot be reached.
    #[error("address {address} unreachable: {reason}")]
    Unreachable {
        /// Target address.
        address: String,
        /// Why the address cannot be reached.
        reason: String,
    },

    /// The target has no handler registered for the operation.
    #[error("no handler for operation {0}")]
    NoHandler(OpId),

    /// The remote handler failed before producing an output.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The bulk region was released or never existed.
    #[error("bulk region {0} is not registered")]
    RegionReleased(u64),

    /// Socket-level failure.
    #[error("i/o: {0}")]
    Io(String),

    /// Malformed frame.
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// The instance has been finalized.
    #[error("fabric instance finalized")]
    Finalized,
}

impl From<std::io::Error> for FabricError {
    fn from(err: std::io::Error) -> Self {
        FabricError::Io(err.to_string())
    }
}

/// Opaque handle to a registered bulk region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BulkDescriptor {
    /// Region identifier, unique within the fabric.
    pub id: u64,
    /// Region length in bytes.
    pub len: usize,
}

/// A call arriving at a registered handler.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    /// Operation being invoked.
    pub op: OpId,
    /// Encoded input.
    pub input: Vec<u8>,
    /// Bytes of the caller's bulk region, when one is attached.
    pub bulk: Option<Bytes>,
}

/// A call leaving through a [`RemoteTarget`].
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// Operation being invoked.
    pub op: OpId,
    /// Encoded input.
    pub input: Vec<u8>,
    /// Bulk region exposed to the remote handler for this call.
    pub bulk: Option<BulkDescriptor>,
}

/// Error a handler returns instead of an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Handler for one served operation.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Produce the encoded output for `call`.
    async fn handle(&self, call: IncomingCall) -> Result<Vec<u8>, HandlerError>;
}

/// [`RpcHandler`] backed by an async closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, call: IncomingCall) -> Result<Vec<u8>, HandlerError> {
        (self.0)(call).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A transport library able to initialize instances for some protocols.
pub trait Fabric: Send + Sync {
    /// Initialize a listening instance for `protocol`.
    fn init(
        &self,
        protocol: Protocol,
        options: &InitOptions,
    ) -> Result<Arc<dyn FabricInstance>, FabricError>;
}

/// One initialized, listening transport instance.
#[async_trait]
pub trait FabricInstance: Send + Sync {
    /// Protocol this instance was initialized with.
    fn protocol(&self) -> Protocol;

    /// Address string other processes resolve to reach this instance.
    fn self_address(&self) -> Result<String, FabricError>;

    /// Attach a handler (or none, for invoke-only operations) to `op`.
    fn register(&self, op: OpId, handler: Option<Arc<dyn RpcHandler>>);

    /// Resolve an address string into a target calls can be forwarded to.
    async fn lookup(&self, address: &str) -> Result<Arc<dyn RemoteTarget>, FabricError>;

    /// Register `data` as a read-only region remote handlers may pull.
    fn create_bulk(&self, data: Bytes) -> Result<BulkDescriptor, FabricError>;

    /// Release a region created by [`create_bulk`](Self::create_bulk).
    fn free_bulk(&self, descriptor: BulkDescriptor);

    /// Stop listening and release transport resources.
    fn finalize(&self);
}

/// A resolved remote address.
///
/// Dropping the last reference releases the address.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    /// Address string this target was resolved from.
    fn address(&self) -> &str;

    /// Deliver `call` and wait for the encoded output.
    async fn forward(&self, call: OutboundCall) -> Result<Vec<u8>, FabricError>;
}

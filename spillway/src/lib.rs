//! # spillway
//!
//! Server-side RPC substrate for the spillway burst-buffer file system.
//!
//! Each server process owns one [`RpcContext`] with two endpoints:
//!
//! - **local**: shared-memory, serves attached clients and pushes
//!   [`Notification`]s back to them
//! - **remote**: network, serves and calls the other servers of the job
//!
//! Endpoint addresses are exchanged through the [`AddressDirectory`], a
//! thin layer over the cluster key-value store. Peer connections are
//! cached by the [`ConnectionManager`], either all at startup
//! ([`ConnectPolicy::Eager`]) or on first use ([`ConnectPolicy::Lazy`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use spillway::{RpcConfig, RpcContext};
//! use spillway_core::{JobInfo, MemoryClientRegistry, MemoryKeyValueStore};
//!
//! # async fn run() -> spillway_core::RpcResult<()> {
//! let job = JobInfo::new(0, 1).expect("rank below size");
//! let context = RpcContext::builder(
//!     RpcConfig::default(),
//!     job,
//!     Arc::new(MemoryKeyValueStore::new(1)),
//!     Arc::new(MemoryClientRegistry::new()),
//! )
//! .init()
//! .await?;
//! context.connect_servers().await?.status()?;
//! context.finalize().await.status()
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod config;
mod context;
mod directory;
pub mod logging;
mod notify;
pub mod ops;
mod peers;

pub use config::{ConfigError, LogLevel, LoggingConfig, RpcConfig};
pub use context::{FinalizeReport, InvokedOps, RpcContext, RpcContextBuilder};
pub use directory::AddressDirectory;
pub use notify::{
    Ack, AckOutput, HeartbeatInput, MreadCompleteInput, MreadDataInput, Notification,
    NotificationKind, TransferCompleteInput, UnlinkCallbackInput,
};
pub use ops::ServiceHandlers;
pub use peers::{ConnectPolicy, ConnectReport, ConnectionManager, PeerState};

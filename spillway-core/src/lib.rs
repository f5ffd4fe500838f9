//! # spillway-core
//!
//! Core types and collaborator traits for the spillway RPC substrate.
//!
//! - **Types**: [`Domain`], [`Protocol`], [`OpId`], [`ClientKey`], [`JobInfo`]
//! - **Errors**: the [`RpcError`] taxonomy shared by every crate
//! - **Codec**: [`MessageCodec`] with the default [`JsonCodec`]
//! - **Collaborators**: the cluster [`KeyValueStore`] and the
//!   [`ClientRegistry`], each with an in-process implementation

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod error;
mod keyval;
mod registry;
mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use error::{KeyValError, RpcError, RpcResult};
pub use keyval::{KeyValueStore, MemoryKeyValueStore};
pub use registry::{ClientRegistry, MemoryClientRegistry};
pub use types::{ClientKey, Domain, JobInfo, OpId, Protocol, UnknownProtocol};

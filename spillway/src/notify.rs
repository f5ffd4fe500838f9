//! Client notification protocol.
//!
//! A server pushes asynchronous results to one attached client through the
//! local endpoint. The client is found through the [`ClientRegistry`]; a
//! registry miss fails with `ClientNotFound` before any transport work.
//!
//! | Kind | Timed | Bulk |
//! |---|---|---|
//! | heartbeat | yes | no |
//! | mread data | yes | read bytes, when non-empty |
//! | mread complete | yes | no |
//! | transfer complete | yes | no |
//! | unlink callback | no | no |
//!
//! Every client answers with `{ "ret": <i32> }`, surfaced as an [`Ack`].
//! A transport failure is an `Err`; a client reporting a failure is an
//! `Ok(Ack)` with a non-zero code.
//!
//! [`ClientRegistry`]: spillway_core::ClientRegistry

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spillway_core::{ClientKey, CodecError, MessageCodec, RpcError, RpcResult};
use spillway_transport::Connection;

use crate::context::RpcContext;
use crate::ops;

/// Input of the heartbeat notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatInput {
    /// Application id.
    pub app_id: i32,
    /// Client id.
    pub client_id: i32,
}

/// Input of the multi-read data notification. The bytes travel in the
/// bulk region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MreadDataInput {
    /// Application id.
    pub app_id: i32,
    /// Client id.
    pub client_id: i32,
    /// Read group id.
    pub mread_id: i32,
    /// Index of the read within the group.
    pub read_index: i32,
    /// File offset of the first byte.
    pub read_offset: u64,
    /// Number of bytes in the bulk region.
    pub bulk_size: u64,
}

/// Input of the multi-read completion notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MreadCompleteInput {
    /// Application id.
    pub app_id: i32,
    /// Client id.
    pub client_id: i32,
    /// Read group id.
    pub mread_id: i32,
    /// Index of the read within the group.
    pub read_index: i32,
    /// Error code of the read, zero on success.
    pub read_error: i32,
}

/// Input of the transfer completion notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompleteInput {
    /// Application id.
    pub app_id: i32,
    /// Client id.
    pub client_id: i32,
    /// Transfer id.
    pub transfer_id: i32,
    /// Bytes moved.
    pub transfer_size_bytes: u64,
    /// Whole seconds elapsed.
    pub transfer_time_sec: u64,
    /// Microseconds elapsed beyond `transfer_time_sec`.
    pub transfer_time_usec: u32,
    /// Error code of the transfer, zero on success.
    pub error_code: i32,
}

/// Input of the unlink callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkCallbackInput {
    /// Application id.
    pub app_id: i32,
    /// Client id.
    pub client_id: i32,
    /// Global file id of the unlinked file.
    pub gfid: i32,
}

/// Response every client returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckOutput {
    /// Client-side result code.
    pub ret: i32,
}

/// Acknowledgement code returned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack(pub i32);

impl Ack {
    /// Raw code.
    pub fn code(&self) -> i32 {
        self.0
    }

    /// Whether the client reported success.
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

/// Notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// Liveness check.
    Heartbeat,
    /// Multi-read data delivery.
    MreadData,
    /// Multi-read completion.
    MreadComplete,
    /// Transfer completion.
    TransferComplete,
    /// Unlink callback.
    UnlinkCallback,
}

impl NotificationKind {
    /// Operation the kind is delivered through.
    pub const fn op_name(&self) -> &'static str {
        match self {
            NotificationKind::Heartbeat => ops::HEARTBEAT,
            NotificationKind::MreadData => ops::MREAD_REQ_DATA,
            NotificationKind::MreadComplete => ops::MREAD_REQ_COMPLETE,
            NotificationKind::TransferComplete => ops::TRANSFER_COMPLETE,
            NotificationKind::UnlinkCallback => ops::UNLINK_CALLBACK,
        }
    }

    /// Whether the call is bounded by the client timeout.
    ///
    /// The unlink callback is the one untimed notification.
    // TODO: decide whether unlink callbacks should share the client timeout
    // once clients acknowledge them promptly; until then they wait forever.
    pub const fn is_timed(&self) -> bool {
        !matches!(self, NotificationKind::UnlinkCallback)
    }
}

/// One notification to deliver to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Liveness check.
    Heartbeat,
    /// Bytes for one read of a multi-read group.
    MreadData {
        /// Read group id.
        mread_id: i32,
        /// Index of the read within the group.
        read_index: i32,
        /// File offset of the first byte.
        offset: u64,
        /// Read bytes, exposed to the client without copying.
        data: Bytes,
    },
    /// One read of a multi-read group finished.
    MreadComplete {
        /// Read group id.
        mread_id: i32,
        /// Index of the read within the group.
        read_index: i32,
        /// Error code of the read.
        error_code: i32,
    },
    /// A transfer finished.
    TransferComplete {
        /// Transfer id.
        transfer_id: i32,
        /// Bytes moved.
        bytes_moved: u64,
        /// Time the transfer took.
        elapsed: Duration,
        /// Error code of the transfer.
        error_code: i32,
    },
    /// A file the client had open was unlinked.
    UnlinkCallback {
        /// Global file id.
        gfid: i32,
    },
}

impl Notification {
    /// Kind of this notification.
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Heartbeat => NotificationKind::Heartbeat,
            Notification::MreadData { .. } => NotificationKind::MreadData,
            Notification::MreadComplete { .. } => NotificationKind::MreadComplete,
            Notification::TransferComplete { .. } => NotificationKind::TransferComplete,
            Notification::UnlinkCallback { .. } => NotificationKind::UnlinkCallback,
        }
    }

    /// Bytes to expose as a bulk region, if any.
    pub fn bulk(&self) -> Option<&Bytes> {
        match self {
            Notification::MreadData { data, .. } if !data.is_empty() => Some(data),
            _ => None,
        }
    }

    /// Encode the call input addressed to `key`.
    pub fn encode_input<C: MessageCodec>(
        &self,
        codec: &C,
        key: ClientKey,
    ) -> Result<Vec<u8>, CodecError> {
        let ClientKey { app_id, client_id } = key;
        match self {
            Notification::Heartbeat => codec.encode(&HeartbeatInput { app_id, client_id }),
            Notification::MreadData {
                mread_id,
                read_index,
                offset,
                data,
            } => codec.encode(&MreadDataInput {
                app_id,
                client_id,
                mread_id: *mread_id,
                read_index: *read_index,
                read_offset: *offset,
                bulk_size: data.len() as u64,
            }),
            Notification::MreadComplete {
                mread_id,
                read_index,
                error_code,
            } => codec.encode(&MreadCompleteInput {
                app_id,
                client_id,
                mread_id: *mread_id,
                read_index: *read_index,
                read_error: *error_code,
            }),
            Notification::TransferComplete {
                transfer_id,
                bytes_moved,
                elapsed,
                error_code,
            } => codec.encode(&TransferCompleteInput {
                app_id,
                client_id,
                transfer_id: *transfer_id,
                transfer_size_bytes: *bytes_moved,
                transfer_time_sec: elapsed.as_secs(),
                transfer_time_usec: elapsed.subsec_micros(),
                error_code: *error_code,
            }),
            Notification::UnlinkCallback { gfid } => codec.encode(&UnlinkCallbackInput {
                app_id,
                client_id,
                gfid: *gfid,
            }),
        }
    }
}

/// Resolved client connections, keyed by client and the address they
/// were resolved from.
#[derive(Default)]
pub(crate) struct ClientConnections {
    entries: Mutex<HashMap<ClientKey, Connection>>,
}

impl ClientConnections {
    // No holder leaves the map half-updated, so poison is ignored.
    fn entries(&self) -> MutexGuard<'_, HashMap<ClientKey, Connection>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: ClientKey, address: &str) -> Option<Connection> {
        self.entries()
            .get(&key)
            .filter(|conn| conn.address() == address)
            .cloned()
    }

    fn insert(&self, key: ClientKey, connection: Connection) {
        self.entries().insert(key, connection);
    }

    pub(crate) fn remove(&self, key: ClientKey) -> bool {
        self.entries().remove(&key).is_some()
    }

    pub(crate) fn clear(&self) -> usize {
        self.entries().drain().count()
    }
}

impl<C: MessageCodec> RpcContext<C> {
    /// Deliver `notification` to the client `key` and return its
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// - `ClientNotFound` if the client is unknown or unreachable; nothing
    ///   is sent
    /// - `Timeout` if a timed notification is not answered in time
    /// - `Transport` if the call failed or the answer is undecodable
    /// - `Bulk` if the read bytes could not be exposed
    /// - `ShuttingDown` once [`shutdown`](Self::shutdown) has begun
    pub async fn notify(&self, key: ClientKey, notification: Notification) -> RpcResult<Ack> {
        let _call = self.gate.enter()?;
        let kind = notification.kind();
        let op = kind.op_name();

        let connection = self.client_connection(key).await?;
        let input = notification.encode_input(&self.codec, key)?;

        let region = match notification.bulk() {
            Some(data) => Some(self.local.expose(data.clone())?),
            None => None,
        };

        let mut call = self.local.call(&connection, op)?;
        if kind.is_timed() {
            call = call.with_timeout(self.config.client_timeout());
        }
        if let Some(region) = &region {
            call = call.with_bulk(region);
        }
        let result = call.forward(input).await;
        drop(region);

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if matches!(e, RpcError::Transport { .. }) {
                    self.clients.remove(key);
                }
                tracing::warn!(client = %key, op, error = %e, "notification failed");
                return Err(e);
            }
        };

        let ack: AckOutput = self.codec.decode(&output).map_err(|e| RpcError::Transport {
            operation: op.to_string(),
            reason: format!("undecodable acknowledgement: {}", e),
        })?;
        tracing::debug!(client = %key, op, ret = ack.ret, "notification delivered");
        Ok(Ack(ack.ret))
    }

    /// Forget the cached connection to a client. Returns whether one was
    /// cached.
    pub fn forget_client(&self, key: ClientKey) -> bool {
        self.clients.remove(key)
    }

    async fn client_connection(&self, key: ClientKey) -> RpcResult<Connection> {
        let Some(address) = self.registry.resolve(key) else {
            tracing::debug!(client = %key, "client not registered");
            return Err(RpcError::ClientNotFound { key });
        };

        if let Some(connection) = self.clients.get(key, &address) {
            return Ok(connection);
        }

        match self.local.lookup(&address).await {
            Ok(connection) => {
                tracing::debug!(client = %key, address = %address, "client connection resolved");
                self.clients.insert(key, connection.clone());
                Ok(connection)
            }
            Err(e) => {
                tracing::warn!(client = %key, address = %address, error = %e, "client address unresolvable");
                Err(RpcError::ClientNotFound { key })
            }
        }
    }
}

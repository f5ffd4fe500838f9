//! Operation catalogue and served-operation handlers.
//!
//! Names follow `spillway_<name>_rpc`. Every catalogued name is registered
//! at init whether or not a handler is supplied; an operation without a
//! handler answers incoming calls with a "no handler" transport failure.

use std::collections::HashMap;
use std::sync::Arc;

use spillway_transport::RpcHandler;

/// Heartbeat sent to a client.
pub const HEARTBEAT: &str = "spillway_heartbeat_rpc";
/// Multi-read data delivery to a client.
pub const MREAD_REQ_DATA: &str = "spillway_mread_req_data_rpc";
/// Multi-read completion sent to a client.
pub const MREAD_REQ_COMPLETE: &str = "spillway_mread_req_complete_rpc";
/// Transfer completion sent to a client.
pub const TRANSFER_COMPLETE: &str = "spillway_transfer_complete_rpc";
/// Unlink callback sent to a client.
pub const UNLINK_CALLBACK: &str = "spillway_unlink_callback_rpc";

/// Operations served for clients on the local endpoint.
pub const CLIENT_SERVED: [&str; 14] = [
    "spillway_attach_rpc",
    "spillway_mount_rpc",
    "spillway_unmount_rpc",
    "spillway_metaget_rpc",
    "spillway_metaset_rpc",
    "spillway_fsync_rpc",
    "spillway_filesize_rpc",
    "spillway_transfer_rpc",
    "spillway_truncate_rpc",
    "spillway_unlink_rpc",
    "spillway_laminate_rpc",
    "spillway_mread_rpc",
    "spillway_node_local_extents_get_rpc",
    "spillway_get_gfids_rpc",
];

/// Operations invoked on clients through the local endpoint.
pub const CLIENT_INVOKED: [&str; 5] = [
    HEARTBEAT,
    MREAD_REQ_DATA,
    MREAD_REQ_COMPLETE,
    TRANSFER_COMPLETE,
    UNLINK_CALLBACK,
];

/// Operations served for, and invoked on, peer servers.
pub const PEER: [&str; 20] = [
    "spillway_bcast_progress_rpc",
    "spillway_chunk_read_request_rpc",
    "spillway_chunk_read_response_rpc",
    "spillway_add_extents_rpc",
    "spillway_extent_bcast_rpc",
    "spillway_find_extents_rpc",
    "spillway_fileattr_bcast_rpc",
    "spillway_filesize_rpc",
    "spillway_laminate_rpc",
    "spillway_laminate_bcast_rpc",
    "spillway_metaget_rpc",
    "spillway_metaset_rpc",
    "spillway_server_pid_rpc",
    "spillway_transfer_rpc",
    "spillway_transfer_bcast_rpc",
    "spillway_truncate_rpc",
    "spillway_truncate_bcast_rpc",
    "spillway_unlink_bcast_rpc",
    "spillway_node_local_extents_get_rpc",
    "spillway_metaget_all_bcast_rpc",
];

/// Handlers supplied by the surrounding server for served operations.
#[derive(Clone, Default)]
pub struct ServiceHandlers {
    client: HashMap<String, Arc<dyn RpcHandler>>,
    peer: HashMap<String, Arc<dyn RpcHandler>>,
}

impl ServiceHandlers {
    /// No handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `name` for clients with `handler`.
    pub fn with_client(mut self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        self.client.insert(name.into(), handler);
        self
    }

    /// Serve `name` for peers with `handler`.
    pub fn with_peer(mut self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        self.peer.insert(name.into(), handler);
        self
    }

    /// Handler for a client-facing operation.
    pub fn client(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.client.get(name).cloned()
    }

    /// Handler for a peer-facing operation.
    pub fn peer(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.peer.get(name).cloned()
    }

    /// Supplied names missing from the catalogue. They are not registered.
    pub fn uncatalogued(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .client
            .keys()
            .filter(|n| !CLIENT_SERVED.contains(&n.as_str()))
            .chain(self.peer.keys().filter(|n| !PEER.contains(&n.as_str())))
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }
}

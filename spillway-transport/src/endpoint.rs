//! Endpoint: one listening and sending RPC context bound to a domain.
//!
//! An endpoint is opened by trying transport protocols in order until one
//! initializes, owns its [`OperationTable`], resolves peer addresses into
//! [`Connection`]s, and issues calls through [`PendingCall`].
//!
//! Closing is ownership-consuming: [`Endpoint::close`] takes `self`, so a
//! closed endpoint cannot be closed again or used for another call.
//!
//! ```rust,ignore
//! let endpoint = Endpoint::open(&fabric, Domain::Remote, &candidates, &options)?;
//! let conn = endpoint.lookup(&peer_address).await?;
//! let output = endpoint
//!     .call(&conn, "spillway_server_pid_rpc")?
//!     .with_timeout(Duration::from_secs(15))
//!     .forward(input)
//!     .await?;
//! endpoint.close();
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spillway_core::{Domain, OpId, Protocol, RpcError, RpcResult};

use crate::fabric::{
    BulkDescriptor, Fabric, FabricError, FabricInstance, InitOptions, OutboundCall, RemoteTarget,
    RpcHandler,
};
use crate::op_table::OperationTable;

/// An open RPC endpoint for one domain.
pub struct Endpoint {
    domain: Domain,
    protocol: Protocol,
    address: String,
    instance: Arc<dyn FabricInstance>,
    operations: OperationTable,
    closed: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("domain", &self.domain)
            .field("protocol", &self.protocol)
            .field("address", &self.address)
            .field("operations", &self.operations.len())
            .finish()
    }
}

impl Endpoint {
    /// Open an endpoint, trying each candidate protocol in order.
    ///
    /// # Errors
    ///
    /// - `TransportUnavailable` if no candidate initializes
    /// - `AddressResolution` if the chosen transport cannot report its own
    ///   address; the instance is finalized before returning
    pub fn open(
        fabric: &dyn Fabric,
        domain: Domain,
        candidates: &[Protocol],
        options: &InitOptions,
    ) -> RpcResult<Endpoint> {
        for &protocol in candidates {
            let instance = match fabric.init(protocol, options) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(
                        domain = %domain,
                        protocol = %protocol,
                        error = %e,
                        "transport failed to initialize, trying next candidate"
                    );
                    continue;
                }
            };

            let address = match instance.self_address() {
                Ok(address) => address,
                Err(e) => {
                    tracing::error!(
                        domain = %domain,
                        protocol = %protocol,
                        error = %e,
                        "endpoint cannot resolve its own address"
                    );
                    instance.finalize();
                    return Err(RpcError::AddressResolution {
                        domain,
                        reason: e.to_string(),
                    });
                }
            };

            tracing::info!(
                domain = %domain,
                protocol = %protocol,
                address = %address,
                "endpoint open"
            );
            return Ok(Endpoint {
                domain,
                protocol,
                address,
                instance,
                operations: OperationTable::new(domain),
                closed: false,
            });
        }

        tracing::error!(domain = %domain, tried = candidates.len(), "no transport available");
        Err(RpcError::TransportUnavailable {
            domain,
            tried: candidates.to_vec(),
        })
    }

    /// Domain this endpoint serves.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Protocol the endpoint was opened with.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// This endpoint's own resolvable address.
    pub fn self_address(&self) -> &str {
        &self.address
    }

    /// Operations registered on this endpoint.
    pub fn operations(&self) -> &OperationTable {
        &self.operations
    }

    /// Register an operation. Served operations pass a handler; operations
    /// this process only invokes pass `None`.
    pub fn register(
        &mut self,
        name: &str,
        handler: Option<Arc<dyn RpcHandler>>,
    ) -> RpcResult<OpId> {
        let served = handler.is_some();
        let id = self.operations.insert(name)?;
        self.instance.register(id, handler);
        tracing::trace!(domain = %self.domain, op = name, id = %id, served, "operation registered");
        Ok(id)
    }

    /// Identifier of a registered operation.
    pub fn op_id(&self, name: &str) -> RpcResult<OpId> {
        self.operations
            .get(name)
            .ok_or_else(|| RpcError::UnknownOperation {
                domain: self.domain,
                name: name.to_string(),
            })
    }

    /// Resolve an address string into a connection.
    pub async fn lookup(&self, address: &str) -> Result<Connection, FabricError> {
        let target = self.instance.lookup(address).await?;
        Ok(Connection {
            domain: self.domain,
            target,
        })
    }

    /// Expose `data` as a read-only bulk region for one call.
    ///
    /// The region is released when the returned guard is dropped.
    pub fn expose(&self, data: Bytes) -> RpcResult<BulkRegion> {
        let size = data.len();
        let descriptor = self
            .instance
            .create_bulk(data)
            .map_err(|e| RpcError::Bulk {
                size,
                reason: e.to_string(),
            })?;
        Ok(BulkRegion {
            instance: Arc::clone(&self.instance),
            descriptor,
        })
    }

    /// Start a call of `op_name` on `conn`.
    pub fn call<'a>(&'a self, conn: &'a Connection, op_name: &str) -> RpcResult<PendingCall<'a>> {
        let op = self.op_id(op_name)?;
        if conn.domain != self.domain {
            return Err(RpcError::Transport {
                operation: op_name.to_string(),
                reason: format!(
                    "{} connection used on {} endpoint",
                    conn.domain, self.domain
                ),
            });
        }
        Ok(PendingCall {
            target: &conn.target,
            op,
            name: op_name.to_string(),
            timeout: None,
            bulk: None,
        })
    }

    /// Release the transport. Consumes the endpoint.
    pub fn close(mut self) {
        self.finalize_once();
    }

    fn finalize_once(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.instance.finalize();
        tracing::info!(domain = %self.domain, address = %self.address, "endpoint closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(domain = %self.domain, "endpoint dropped without close");
            self.finalize_once();
        }
    }
}

/// A resolved address on one domain. Clones share the underlying target;
/// the address is released when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    domain: Domain,
    target: Arc<dyn RemoteTarget>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("domain", &self.domain)
            .field("address", &self.target.address())
            .finish()
    }
}

impl Connection {
    /// Address the connection was resolved from.
    pub fn address(&self) -> &str {
        self.target.address()
    }

    /// Domain of the endpoint that resolved the connection.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Whether both handles share one resolved target.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.target, &other.target)
    }
}

/// A registered bulk region, released on drop.
pub struct BulkRegion {
    instance: Arc<dyn FabricInstance>,
    descriptor: BulkDescriptor,
}

impl BulkRegion {
    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.descriptor.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptor.len == 0
    }

    /// Transport handle for the region.
    pub fn descriptor(&self) -> BulkDescriptor {
        self.descriptor
    }
}

impl Drop for BulkRegion {
    fn drop(&mut self) {
        self.instance.free_bulk(self.descriptor);
    }
}

/// Builder for one outbound call.
pub struct PendingCall<'a> {
    target: &'a Arc<dyn RemoteTarget>,
    op: OpId,
    name: String,
    timeout: Option<Duration>,
    bulk: Option<BulkDescriptor>,
}

impl PendingCall<'_> {
    /// Fail with `Timeout` if no response arrives within `after`.
    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    /// Attach a bulk region the remote handler may pull.
    pub fn with_bulk(mut self, region: &BulkRegion) -> Self {
        self.bulk = Some(region.descriptor());
        self
    }

    /// Send `input` and wait for the encoded output.
    ///
    /// # Errors
    ///
    /// - `Timeout` if a deadline was set and elapsed
    /// - `Transport` if the call failed before producing an output
    pub async fn forward(self, input: Vec<u8>) -> RpcResult<Vec<u8>> {
        let call = OutboundCall {
            op: self.op,
            input,
            bulk: self.bulk,
        };
        let address = self.target.address();
        let attempt = self.target.forward(call);

        let result = match self.timeout {
            Some(after) => match tokio::time::timeout(after, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(op = %self.name, address = %address, ?after, "call timed out");
                    return Err(RpcError::Timeout {
                        operation: self.name,
                        after,
                    });
                }
            },
            None => attempt.await,
        };

        result.map_err(|e| {
            tracing::debug!(op = %self.name, address = %address, error = %e, "call failed in transport");
            RpcError::Transport {
                operation: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{handler_fn, HandlerError, IncomingCall, MemoryFabric};

    fn open(fabric: &MemoryFabric, domain: Domain, candidates: &[Protocol]) -> RpcResult<Endpoint> {
        Endpoint::open(fabric, domain, candidates, &InitOptions::default())
    }

    #[test]
    fn test_open_falls_back_in_order() {
        let fabric = MemoryFabric::new();
        fabric.disable_protocol(Protocol::OfiVerbs);
        let endpoint = open(
            &fabric,
            Domain::Remote,
            &[Protocol::OfiVerbs, Protocol::OfiSockets, Protocol::BmiTcp],
        )
        .expect("open");
        assert_eq!(endpoint.protocol(), Protocol::OfiSockets);
        assert!(endpoint.self_address().starts_with("ofi+sockets://"));
        endpoint.close();
        assert_eq!(fabric.stats().instances_live, 0);
    }

    #[test]
    fn test_open_exhausted_candidates() {
        let fabric = MemoryFabric::new();
        fabric.disable_protocol(Protocol::OfiTcp);
        fabric.disable_protocol(Protocol::BmiTcp);
        let err = open(&fabric, Domain::Remote, &[Protocol::OfiTcp, Protocol::BmiTcp])
            .expect_err("nothing initializes");
        match err {
            RpcError::TransportUnavailable { domain, tried } => {
                assert_eq!(domain, Domain::Remote);
                assert_eq!(tried, vec![Protocol::OfiTcp, Protocol::BmiTcp]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_address_failure_releases_instance() {
        let fabric = MemoryFabric::new();
        fabric.fail_self_address(Protocol::SharedMemory);
        let err = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect_err("no address");
        assert!(matches!(err, RpcError::AddressResolution { .. }));
        assert_eq!(fabric.stats().instances_live, 0);
    }

    #[test]
    fn test_close_and_drop_finalize_once() {
        let fabric = MemoryFabric::new();
        let closed = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("open");
        closed.close();
        let dropped = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("open");
        drop(dropped);

        let stats = fabric.stats();
        assert_eq!(stats.finalize_calls, 2);
        assert_eq!(stats.double_finalizes, 0);
        assert_eq!(stats.instances_live, 0);
    }

    #[test]
    fn test_register_duplicate_and_unknown() {
        let fabric = MemoryFabric::new();
        let mut endpoint = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("open");
        let id = endpoint.register("spillway_mount_rpc", None).expect("register");
        assert_eq!(endpoint.op_id("spillway_mount_rpc").expect("known"), id);
        assert!(matches!(
            endpoint.register("spillway_mount_rpc", None),
            Err(RpcError::DuplicateRegistration { .. })
        ));
        assert!(matches!(
            endpoint.op_id("spillway_unmount_rpc"),
            Err(RpcError::UnknownOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_roundtrip_with_bulk() {
        let fabric = MemoryFabric::new();
        let mut server = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("server");
        let mut client = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("client");

        let handler = handler_fn(|call: IncomingCall| async move {
            let len = call.bulk.map_or(0, |b| b.len());
            Ok::<_, HandlerError>(len.to_string().into_bytes())
        });
        server.register("spillway_mread_req_data_rpc", Some(handler)).expect("serve");
        client.register("spillway_mread_req_data_rpc", None).expect("invoke");

        let conn = client.lookup(server.self_address()).await.expect("lookup");
        {
            let region = client.expose(Bytes::from(vec![1u8; 4096])).expect("expose");
            let output = client
                .call(&conn, "spillway_mread_req_data_rpc")
                .expect("call")
                .with_timeout(Duration::from_secs(5))
                .with_bulk(&region)
                .forward(Vec::new())
                .await
                .expect("forward");
            assert_eq!(output, b"4096");
            assert_eq!(fabric.stats().bulk_live(), 1);
        }
        assert_eq!(fabric.stats().bulk_live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let fabric = MemoryFabric::new();
        let mut server = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("server");
        server
            .register(
                "spillway_heartbeat_rpc",
                Some(handler_fn(|_call: IncomingCall| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, HandlerError>(Vec::new())
                })),
            )
            .expect("serve");

        let conn = server.lookup(server.self_address()).await.expect("lookup");
        let err = server
            .call(&conn, "spillway_heartbeat_rpc")
            .expect("call")
            .with_timeout(Duration::from_millis(100))
            .forward(Vec::new())
            .await
            .expect_err("timeout");
        assert!(matches!(err, RpcError::Timeout { after, .. } if after == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_handler_failure_is_transport_error() {
        let fabric = MemoryFabric::new();
        let mut server = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("server");
        server
            .register(
                "spillway_fsync_rpc",
                Some(handler_fn(|_call: IncomingCall| async move {
                    Err::<Vec<u8>, _>(HandlerError("disk on fire".to_string()))
                })),
            )
            .expect("serve");
        let conn = server.lookup(server.self_address()).await.expect("lookup");
        let err = server
            .call(&conn, "spillway_fsync_rpc")
            .expect("call")
            .forward(Vec::new())
            .await
            .expect_err("handler failed");
        assert!(matches!(err, RpcError::Transport { ref reason, .. } if reason.contains("disk on fire")));
    }

    #[tokio::test]
    async fn test_cross_domain_connection_rejected() {
        let fabric = MemoryFabric::new();
        let mut local = open(&fabric, Domain::Local, &[Protocol::SharedMemory]).expect("local");
        let remote = open(&fabric, Domain::Remote, &[Protocol::OfiTcp]).expect("remote");
        local.register("spillway_heartbeat_rpc", None).expect("register");

        let conn = remote.lookup(remote.self_address()).await.expect("lookup");
        assert_eq!(conn.domain(), Domain::Remote);
        assert!(matches!(
            local.call(&conn, "spillway_heartbeat_rpc"),
            Err(RpcError::Transport { .. })
        ));
    }
}

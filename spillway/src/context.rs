//! RPC context: the process's two endpoints and everything built on them.
//!
//! [`RpcContext`] is constructed once through [`RpcContextBuilder::init`]
//! and torn down once through [`RpcContext::finalize`], which consumes it.
//!
//! Startup:
//!
//! 1. open the local endpoint and publish its address
//! 2. open the remote endpoint and publish its address
//! 3. register the operation catalogue on both endpoints
//! 4. [`connect_servers`](RpcContext::connect_servers): fence the remote
//!    domain, then connect to every rank under the eager policy
//!
//! Teardown ([`finalize`](RpcContext::finalize)) stops accepting calls,
//! waits for in-flight ones, clears published addresses, releases cached
//! connections, then closes the remote endpoint and the local endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use spillway_core::{
    ClientRegistry, Domain, JobInfo, JsonCodec, KeyValueStore, MessageCodec, OpId, RpcError,
    RpcResult,
};
use spillway_transport::{Connection, Endpoint, Fabric, MemoryFabric, TcpFabric};
use tokio::sync::Notify;

use crate::config::RpcConfig;
use crate::directory::AddressDirectory;
use crate::notify::ClientConnections;
use crate::ops::{self, ServiceHandlers};
use crate::peers::{ConnectPolicy, ConnectReport, ConnectionManager};

/// Builder for [`RpcContext`].
pub struct RpcContextBuilder<C = JsonCodec> {
    config: RpcConfig,
    job: JobInfo,
    store: Arc<dyn KeyValueStore>,
    registry: Arc<dyn ClientRegistry>,
    local_fabric: Option<Arc<dyn Fabric>>,
    remote_fabric: Option<Arc<dyn Fabric>>,
    handlers: ServiceHandlers,
    codec: C,
}

impl RpcContextBuilder<JsonCodec> {
    fn new(
        config: RpcConfig,
        job: JobInfo,
        store: Arc<dyn KeyValueStore>,
        registry: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            config,
            job,
            store,
            registry,
            local_fabric: None,
            remote_fabric: None,
            handlers: ServiceHandlers::default(),
            codec: JsonCodec,
        }
    }
}

impl<C: MessageCodec> RpcContextBuilder<C> {
    /// Fabric for the local endpoint. Defaults to a private [`MemoryFabric`].
    pub fn local_fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.local_fabric = Some(fabric);
        self
    }

    /// Fabric for the remote endpoint. Defaults to [`TcpFabric`].
    pub fn remote_fabric(mut self, fabric: Arc<dyn Fabric>) -> Self {
        self.remote_fabric = Some(fabric);
        self
    }

    /// Use one fabric for both endpoints.
    pub fn fabric(self, fabric: Arc<dyn Fabric>) -> Self {
        self.local_fabric(Arc::clone(&fabric)).remote_fabric(fabric)
    }

    /// Handlers for served operations.
    pub fn handlers(mut self, handlers: ServiceHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Payload codec for notifications and typed peer calls.
    pub fn codec<C2: MessageCodec>(self, codec: C2) -> RpcContextBuilder<C2> {
        RpcContextBuilder {
            config: self.config,
            job: self.job,
            store: self.store,
            registry: self.registry,
            local_fabric: self.local_fabric,
            remote_fabric: self.remote_fabric,
            handlers: self.handlers,
            codec,
        }
    }

    /// Open both endpoints, publish their addresses and register the
    /// operation catalogue.
    ///
    /// # Errors
    ///
    /// `Init` wrapping the first failure. No endpoint stays open and no
    /// address stays published.
    pub async fn init(self) -> RpcResult<RpcContext<C>> {
        let RpcContextBuilder {
            config,
            job,
            store,
            registry,
            local_fabric,
            remote_fabric,
            handlers,
            codec,
        } = self;

        let local_fabric: Arc<dyn Fabric> =
            local_fabric.unwrap_or_else(|| Arc::new(MemoryFabric::new()) as Arc<dyn Fabric>);
        let remote_fabric: Arc<dyn Fabric> =
            remote_fabric.unwrap_or_else(|| Arc::new(TcpFabric::new()) as Arc<dyn Fabric>);
        let fail = |e: RpcError| {
            tracing::error!(rank = job.rank, error = %e, "rpc initialization failed");
            RpcError::Init(Box::new(e))
        };
        config.validate().map_err(|e| fail(e.into()))?;
        let directory = AddressDirectory::new(store, job);

        let mut local = Endpoint::open(
            local_fabric.as_ref(),
            Domain::Local,
            &config.local_protocol_candidates(),
            &config.local_init_options(),
        )
        .map_err(fail)?;
        if let Err(e) = directory.publish(Domain::Local, local.self_address()).await {
            local.close();
            return Err(fail(e));
        }

        let mut remote = match Endpoint::open(
            remote_fabric.as_ref(),
            Domain::Remote,
            &config.remote_protocol_candidates(),
            &config.remote_init_options(),
        ) {
            Ok(remote) => remote,
            Err(e) => {
                abandon(&directory, local, None).await;
                return Err(fail(e));
            }
        };
        if let Err(e) = directory.publish(Domain::Remote, remote.self_address()).await {
            abandon(&directory, local, Some(remote)).await;
            return Err(fail(e));
        }

        let invoked = match register_catalogue(&mut local, &mut remote, &handlers) {
            Ok(invoked) => invoked,
            Err(e) => {
                abandon(&directory, local, Some(remote)).await;
                return Err(fail(e));
            }
        };

        let peers = ConnectionManager::new(
            Domain::Remote,
            config.connect_policy(),
            directory.clone(),
        );

        tracing::info!(
            rank = job.rank,
            size = job.size,
            local = %local.self_address(),
            remote = %remote.self_address(),
            policy = ?config.connect_policy(),
            "rpc context initialized"
        );

        Ok(RpcContext {
            config,
            job,
            codec,
            local,
            remote,
            directory,
            peers,
            clients: ClientConnections::default(),
            registry,
            invoked,
            gate: CallGate::default(),
        })
    }
}

async fn abandon(directory: &AddressDirectory, local: Endpoint, remote: Option<Endpoint>) {
    let published = if remote.is_some() {
        &[Domain::Local, Domain::Remote][..]
    } else {
        &[Domain::Local][..]
    };
    for &domain in published {
        if let Err(e) = directory.clear(domain).await {
            tracing::warn!(domain = %domain, error = %e, "could not clear address after failed init");
        }
    }
    if let Some(remote) = remote {
        remote.close();
    }
    local.close();
}

fn register_catalogue(
    local: &mut Endpoint,
    remote: &mut Endpoint,
    handlers: &ServiceHandlers,
) -> RpcResult<InvokedOps> {
    for name in handlers.uncatalogued() {
        tracing::warn!(op = name, "handler supplied for an operation outside the catalogue");
    }

    let mut invoked = InvokedOps::default();
    for name in ops::CLIENT_SERVED {
        local.register(name, handlers.client(name))?;
    }
    for name in ops::CLIENT_INVOKED {
        let id = local.register(name, None)?;
        invoked.client.insert(name, id);
    }
    for name in ops::PEER {
        let id = remote.register(name, handlers.peer(name))?;
        invoked.peer.insert(name, id);
    }
    Ok(invoked)
}

/// Identifiers of operations this server invokes, per direction.
#[derive(Debug, Default)]
pub struct InvokedOps {
    client: HashMap<&'static str, OpId>,
    peer: HashMap<&'static str, OpId>,
}

impl InvokedOps {
    /// Identifier of an operation invoked on clients.
    pub fn client(&self, name: &str) -> Option<OpId> {
        self.client.get(name).copied()
    }

    /// Identifier of an operation invoked on peers.
    pub fn peer(&self, name: &str) -> Option<OpId> {
        self.peer.get(name).copied()
    }
}

/// Admission control for outbound calls.
#[derive(Default)]
pub(crate) struct CallGate {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    abandoned: AtomicUsize,
    drained: Notify,
}

pub(crate) struct CallPermit<'a> {
    gate: &'a CallGate,
}

impl CallGate {
    pub(crate) fn enter(&self) -> RpcResult<CallPermit<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ShuttingDown);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permit = CallPermit { gate: self };
        // Closed between the check and the increment: back out.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ShuttingDown);
        }
        Ok(permit)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting calls and wait up to `deadline` for in-flight ones.
    /// Returns how many were still running at the deadline.
    async fn close_and_drain(&self, deadline: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        if tokio::time::timeout(deadline, self.idle()).await.is_ok() {
            return 0;
        }
        let abandoned = self.in_flight();
        self.abandoned.fetch_max(abandoned, Ordering::SeqCst);
        abandoned
    }

    fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    async fn idle(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}

/// Outcome of [`RpcContext::finalize`].
#[derive(Debug, Default)]
pub struct FinalizeReport {
    failures: Vec<(&'static str, RpcError)>,
    /// Peer connections released.
    pub peers_released: usize,
    /// Client connections released.
    pub clients_released: usize,
    /// Calls still in flight when the drain deadline passed.
    pub calls_abandoned: usize,
}

impl FinalizeReport {
    fn record(&mut self, step: &'static str, result: RpcResult<()>) {
        if let Err(e) = result {
            tracing::warn!(step, error = %e, "teardown step failed, continuing");
            self.failures.push((step, e));
        }
    }

    /// Teardown steps that failed, in order.
    pub fn failures(&self) -> &[(&'static str, RpcError)] {
        &self.failures
    }

    /// Whether every step succeeded and no call was abandoned.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.calls_abandoned == 0
    }

    /// Aggregate status: the first failure, if any.
    pub fn status(&self) -> RpcResult<()> {
        match self.failures.first() {
            Some((_, e)) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// The server's RPC substrate.
pub struct RpcContext<C = JsonCodec> {
    pub(crate) config: RpcConfig,
    job: JobInfo,
    pub(crate) codec: C,
    pub(crate) local: Endpoint,
    remote: Endpoint,
    directory: AddressDirectory,
    peers: ConnectionManager,
    pub(crate) clients: ClientConnections,
    pub(crate) registry: Arc<dyn ClientRegistry>,
    invoked: InvokedOps,
    pub(crate) gate: CallGate,
}

impl RpcContext<JsonCodec> {
    /// Start building a context for `job`.
    pub fn builder(
        config: RpcConfig,
        job: JobInfo,
        store: Arc<dyn KeyValueStore>,
        registry: Arc<dyn ClientRegistry>,
    ) -> RpcContextBuilder<JsonCodec> {
        RpcContextBuilder::new(config, job, store, registry)
    }
}

impl<C: MessageCodec> RpcContext<C> {
    /// Configuration the context was built with.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// This server's place in the job.
    pub fn job(&self) -> JobInfo {
        self.job
    }

    /// Client-facing endpoint.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Server-facing endpoint.
    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote
    }

    /// Address directory.
    pub fn directory(&self) -> &AddressDirectory {
        &self.directory
    }

    /// Peer connection manager.
    pub fn peers(&self) -> &ConnectionManager {
        &self.peers
    }

    /// Identifiers of operations this server invokes.
    pub fn invoked_ops(&self) -> &InvokedOps {
        &self.invoked
    }

    /// Fence the remote domain, then, under the eager policy, connect to
    /// every rank. Every rank of the job must call this.
    ///
    /// Per-rank failures are reported, not returned: connected ranks stay
    /// usable.
    pub async fn connect_servers(&self) -> RpcResult<ConnectReport> {
        self.directory.fence(Domain::Remote).await?;
        match self.peers.policy() {
            ConnectPolicy::Eager => Ok(self.peers.connect_all(&self.remote).await),
            ConnectPolicy::Lazy => {
                tracing::debug!(rank = self.job.rank, "lazy policy, peers connect on first use");
                Ok(ConnectReport::empty())
            }
        }
    }

    /// Connection to the server at `rank`, honoring the connect policy.
    pub async fn peer_connection(&self, rank: usize) -> RpcResult<Connection> {
        self.peers.get(&self.remote, rank).await
    }

    /// Invoke `op_name` on the server at `rank` with an encoded input.
    pub async fn invoke_peer(
        &self,
        rank: usize,
        op_name: &str,
        input: Vec<u8>,
    ) -> RpcResult<Vec<u8>> {
        let _call = self.gate.enter()?;
        let connection = self.peer_connection(rank).await?;
        self.remote
            .call(&connection, op_name)?
            .with_timeout(self.config.server_timeout())
            .forward(input)
            .await
    }

    /// Typed [`invoke_peer`](Self::invoke_peer) using the context codec.
    pub async fn call_peer<I, O>(&self, rank: usize, op_name: &str, input: &I) -> RpcResult<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = self.codec.encode(input)?;
        let output = self.invoke_peer(rank, op_name, input).await?;
        Ok(self.codec.decode(&output)?)
    }

    /// Stop accepting new calls and wait for in-flight ones, at most for
    /// the longer of the client and server timeouts. Calls made afterwards
    /// fail with `ShuttingDown`. Returns how many calls were abandoned.
    pub async fn shutdown(&self) -> usize {
        let in_flight = self.gate.in_flight();
        let deadline = self.config.drain_timeout();
        tracing::info!(rank = self.job.rank, in_flight, ?deadline, "rpc context draining");
        let abandoned = self.gate.close_and_drain(deadline).await;
        if abandoned > 0 {
            tracing::warn!(
                rank = self.job.rank,
                abandoned,
                ?deadline,
                "drain deadline passed with calls in flight"
            );
        }
        abandoned
    }

    /// Tear the context down. Every step is attempted even if an earlier
    /// one fails.
    pub async fn finalize(self) -> FinalizeReport {
        self.shutdown().await;

        let mut report = FinalizeReport::default();
        report.record(
            "clear local address",
            self.directory.clear(Domain::Local).await,
        );
        report.record(
            "clear remote address",
            self.directory.clear(Domain::Remote).await,
        );
        report.peers_released = self.peers.release_all().await;
        report.clients_released = self.clients.clear();
        report.calls_abandoned = self.gate.abandoned();

        let RpcContext {
            job, local, remote, ..
        } = self;
        remote.close();
        local.close();

        tracing::info!(
            rank = job.rank,
            peers = report.peers_released,
            clients = report.clients_released,
            abandoned = report.calls_abandoned,
            failures = report.failures.len(),
            "rpc context finalized"
        );
        report
    }

    /// Shut down a shared context and finalize it if this is the last
    /// reference. Returns `None` when other references remain; the last
    /// one to call this finalizes.
    pub async fn finalize_shared(self: Arc<Self>) -> Option<FinalizeReport> {
        match Arc::try_unwrap(self) {
            Ok(context) => Some(context.finalize().await),
            Err(shared) => {
                shared.shutdown().await;
                tracing::debug!(
                    rank = shared.job.rank,
                    references = Arc::strong_count(&shared),
                    "context still shared, finalize deferred"
                );
                None
            }
        }
    }
}

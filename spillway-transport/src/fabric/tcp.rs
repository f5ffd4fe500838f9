//! Socket fabric serving `ofi+tcp`, `ofi+sockets` and `bmi+tcp` addresses.
//!
//! Each instance listens on an ephemeral port and answers frames in the
//! [`wire`](crate::wire) format. In [`ProgressMode::Dedicated`] the accept
//! loop and every handler run on a runtime owned by a background thread,
//! with `pool_size` workers; in [`ProgressMode::Caller`] they are spawned
//! on the runtime that initialized the instance.
//!
//! A resolved [`RemoteTarget`] owns one outbound stream shared by every
//! call through it. Requests are tagged with a sequence number and a reader
//! task hands each response to the call waiting on that number, so a slow
//! call does not hold up the others. On the listening side every request
//! runs in its own task. A write error, or a write cancelled half way,
//! discards the stream and the next call reconnects.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use spillway_core::{OpId, Protocol};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::{
    BulkDescriptor, Fabric, FabricError, FabricInstance, IncomingCall, InitOptions, OutboundCall,
    ProgressMode, RemoteTarget, RpcHandler,
};
use crate::wire::{self, Frame, FrameFlags, FrameHeader, HEADER_SIZE};

type HandlerTable = Arc<RwLock<HashMap<OpId, Option<Arc<dyn RpcHandler>>>>>;
type RegionTable = Arc<Mutex<HashMap<u64, Bytes>>>;

/// TCP fabric.
#[derive(Debug, Clone, Copy)]
pub struct TcpFabric {
    bind_ip: IpAddr,
}

impl Default for TcpFabric {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl TcpFabric {
    /// Fabric listening on the loopback interface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fabric listening on `ip`.
    pub fn with_bind_address(ip: IpAddr) -> Self {
        Self { bind_ip: ip }
    }
}

impl Fabric for TcpFabric {
    fn init(
        &self,
        protocol: Protocol,
        options: &InitOptions,
    ) -> Result<Arc<dyn FabricInstance>, FabricError> {
        if !protocol.is_socket_based() {
            return Err(FabricError::Unsupported(protocol));
        }
        let init_failed = |reason: String| FabricError::InitFailed { protocol, reason };

        let listener = std::net::TcpListener::bind((self.bind_ip, 0))
            .map_err(|e| init_failed(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| init_failed(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| init_failed(e.to_string()))?;

        let handlers: HandlerTable = Arc::default();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept = accept_loop(listener, Arc::clone(&handlers), shutdown_rx);

        match options.progress {
            ProgressMode::Dedicated => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(options.pool_size.max(1))
                    .thread_name(format!("spillway-{}", protocol.as_str()))
                    .enable_all()
                    .build()
                    .map_err(|e| init_failed(e.to_string()))?;
                std::thread::Builder::new()
                    .name(format!("spillway-{}-progress", protocol.as_str()))
                    .spawn(move || runtime.block_on(accept))
                    .map_err(|e| init_failed(e.to_string()))?;
            }
            ProgressMode::Caller => {
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    init_failed("caller-driven progress needs a tokio runtime".to_string())
                })?;
                handle.spawn(accept);
            }
        }

        tracing::debug!(
            protocol = %protocol,
            local = %local,
            progress = ?options.progress,
            pool_size = options.pool_size,
            "tcp fabric instance listening"
        );

        Ok(Arc::new(TcpInstance {
            protocol,
            local,
            handlers,
            regions: Arc::default(),
            next_region: AtomicU64::new(0),
            shutdown,
            finalized: AtomicBool::new(false),
        }))
    }
}

struct TcpInstance {
    protocol: Protocol,
    local: SocketAddr,
    handlers: HandlerTable,
    regions: RegionTable,
    next_region: AtomicU64,
    shutdown: watch::Sender<bool>,
    finalized: AtomicBool,
}

#[async_trait]
impl FabricInstance for TcpInstance {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn self_address(&self) -> Result<String, FabricError> {
        if self.local.ip().is_unspecified() {
            return Err(FabricError::NoSelfAddress(format!(
                "listening on unspecified address {}",
                self.local
            )));
        }
        Ok(self.protocol.address(self.local))
    }

    fn register(&self, op: OpId, handler: Option<Arc<dyn RpcHandler>>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(op, handler);
        }
    }

    async fn lookup(&self, address: &str) -> Result<Arc<dyn RemoteTarget>, FabricError> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(FabricError::Finalized);
        }
        let (protocol, location) = Protocol::split_address(address)
            .ok_or_else(|| FabricError::UnknownAddress(address.to_string()))?;
        if protocol != self.protocol {
            return Err(FabricError::Unreachable {
                address: address.to_string(),
                reason: format!("{} instance cannot reach {} addresses", self.protocol, protocol),
            });
        }
        let socket: SocketAddr = location
            .parse()
            .map_err(|_| FabricError::UnknownAddress(address.to_string()))?;

        let target = TcpTarget {
            address: address.to_string(),
            socket,
            regions: Arc::clone(&self.regions),
            link: tokio::sync::Mutex::new(None),
            sequence: AtomicU64::new(0),
        };
        let link = target.open_link().await?;
        *target.link.lock().await = Some(link);
        Ok(Arc::new(target))
    }

    fn create_bulk(&self, data: Bytes) -> Result<BulkDescriptor, FabricError> {
        let id = self.next_region.fetch_add(1, Ordering::SeqCst);
        let len = data.len();
        self.regions
            .lock()
            .map_err(|_| FabricError::Io("region table poisoned".to_string()))?
            .insert(id, data);
        Ok(BulkDescriptor { id, len })
    }

    fn free_bulk(&self, descriptor: BulkDescriptor) {
        let removed = self
            .regions
            .lock()
            .ok()
            .and_then(|mut regions| regions.remove(&descriptor.id));
        if removed.is_none() {
            tracing::warn!(region = descriptor.id, "bulk region released twice");
        }
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            tracing::warn!(local = %self.local, "tcp fabric instance finalized twice");
            return;
        }
        // Receivers may already be gone if the progress thread exited.
        let _ = self.shutdown.send(true);
        tracing::debug!(local = %self.local, "tcp fabric instance finalized");
    }
}

type ReplyTable = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Frame>>>>>;

struct TcpTarget {
    address: String,
    socket: SocketAddr,
    regions: RegionTable,
    link: tokio::sync::Mutex<Option<Link>>,
    sequence: AtomicU64,
}

/// One outbound stream: the write half shared by every call, and a reader
/// task routing responses to waiting calls by sequence number.
struct Link {
    writer: OwnedWriteHalf,
    replies: ReplyTable,
    reader: JoinHandle<()>,
    /// False while a frame is partially written.
    clean: bool,
}

impl Link {
    fn usable(&self) -> bool {
        self.clean && !self.reader.is_finished()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        // Dropping the senders fails every call still waiting on this stream.
        if let Ok(mut table) = self.replies.lock() {
            table.take();
        }
    }
}

/// Forgets a call's reply slot when the call completes or is cancelled.
struct ReplySlot {
    replies: ReplyTable,
    sequence: u64,
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if let Ok(mut table) = self.replies.lock() {
            if let Some(table) = table.as_mut() {
                table.remove(&self.sequence);
            }
        }
    }
}

impl TcpTarget {
    async fn connect(&self) -> Result<TcpStream, FabricError> {
        let stream = TcpStream::connect(self.socket)
            .await
            .map_err(|e| FabricError::Unreachable {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn open_link(&self) -> Result<Link, FabricError> {
        let (reader, writer) = self.connect().await?.into_split();
        let replies: ReplyTable = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(route_replies(
            reader,
            Arc::clone(&replies),
            self.address.clone(),
        ));
        tracing::trace!(address = %self.address, "tcp link opened");
        Ok(Link {
            writer,
            replies,
            reader,
            clean: true,
        })
    }

    fn closed(&self, reason: &str) -> FabricError {
        FabricError::Unreachable {
            address: self.address.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RemoteTarget for TcpTarget {
    fn address(&self) -> &str {
        &self.address
    }

    async fn forward(&self, call: OutboundCall) -> Result<Vec<u8>, FabricError> {
        let bulk = match call.bulk {
            Some(descriptor) => Some(
                self.regions
                    .lock()
                    .ok()
                    .and_then(|regions| regions.get(&descriptor.id).cloned())
                    .ok_or(FabricError::RegionReleased(descriptor.id))?,
            ),
            None => None,
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let flags = if bulk.is_some() {
            FrameFlags::BULK
        } else {
            FrameFlags::default()
        };
        let request = wire::encode_frame(&Frame {
            sequence,
            op: call.op,
            flags,
            payload: wire::request_payload(&call.input, bulk.as_deref()),
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let _slot = {
            let mut link = self.link.lock().await;
            if !link.as_ref().is_some_and(Link::usable) {
                *link = None;
                *link = Some(self.open_link().await?);
            }
            let active = link
                .as_mut()
                .ok_or_else(|| self.closed("no outbound stream"))?;

            let registered = match active.replies.lock() {
                Ok(mut table) => match table.as_mut() {
                    Some(table) => {
                        table.insert(sequence, reply_tx);
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            };
            if !registered {
                *link = None;
                return Err(self.closed("connection closed before request"));
            }
            let slot = ReplySlot {
                replies: Arc::clone(&active.replies),
                sequence,
            };

            active.clean = false;
            let written = active.writer.write_all(&request).await;
            match written {
                Ok(()) => active.clean = true,
                Err(e) => {
                    *link = None;
                    return Err(e.into());
                }
            }
            slot
        };

        let response = reply_rx
            .await
            .map_err(|_| self.closed("connection closed before response"))?;
        if !response.flags.contains(FrameFlags::RESPONSE) {
            return Err(FabricError::Io(format!(
                "frame {} is not a response",
                response.sequence
            )));
        }
        if response.flags.contains(FrameFlags::FAILED) {
            return Err(FabricError::Handler(
                String::from_utf8_lossy(&response.payload).into_owned(),
            ));
        }
        Ok(response.payload)
    }
}

async fn route_replies(mut reader: OwnedReadHalf, replies: ReplyTable, address: String) {
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let waiting = replies
                    .lock()
                    .ok()
                    .and_then(|mut table| table.as_mut()?.remove(&frame.sequence));
                match waiting {
                    // The caller may have timed out since registering.
                    Some(reply) => {
                        let _ = reply.send(frame);
                    }
                    None => tracing::trace!(
                        address = %address,
                        sequence = frame.sequence,
                        "response to an abandoned call"
                    ),
                }
            }
            Ok(None) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    tracing::debug!(address = %address, reason = %reason, "tcp reply reader stopped");
    if let Ok(mut table) = replies.lock() {
        table.take();
    }
}

/// Read one frame. Returns `None` on a clean end of stream.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FabricError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let payload_len = FrameHeader::deserialize(&header)?.payload_len()?;
    let mut data = Vec::with_capacity(HEADER_SIZE + payload_len);
    data.extend_from_slice(&header);
    data.resize(HEADER_SIZE + payload_len, 0);
    reader.read_exact(&mut data[HEADER_SIZE..]).await?;

    Ok(Some(wire::decode_frame(&data)?))
}

async fn accept_loop(
    listener: std::net::TcpListener,
    handlers: HandlerTable,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "tcp fabric could not adopt listener");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(peer = %peer, "tcp fabric accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&handlers),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "tcp fabric accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("tcp fabric accept loop stopped");
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

async fn serve_connection(
    stream: TcpStream,
    handlers: HandlerTable,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => return,
        };
        match frame {
            Ok(Some(frame)) => {
                tokio::spawn(answer(frame, Arc::clone(&handlers), Arc::clone(&writer)));
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "dropping connection after malformed frame");
                return;
            }
        }
    }
}

/// Run the handler for one request and write its response. Responses of
/// concurrent requests on one connection are written whole, one at a time.
async fn answer(frame: Frame, handlers: HandlerTable, writer: SharedWriter) {
    let response = match dispatch(&handlers, &frame).await {
        Ok(output) => Frame {
            sequence: frame.sequence,
            op: frame.op,
            flags: FrameFlags::RESPONSE,
            payload: output,
        },
        Err(e) => failure(&frame, e.to_string()),
    };

    let bytes = match wire::encode_frame(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, op = %frame.op, "response does not fit a frame");
            match wire::encode_frame(&failure(&frame, format!("response too large: {}", e))) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = writer.lock().await.write_all(&bytes).await {
        tracing::debug!(error = %e, "peer went away before response");
    }
}

fn failure(request: &Frame, reason: String) -> Frame {
    Frame {
        sequence: request.sequence,
        op: request.op,
        flags: FrameFlags::RESPONSE.with(FrameFlags::FAILED),
        payload: reason.into_bytes(),
    }
}

async fn dispatch(handlers: &HandlerTable, frame: &Frame) -> Result<Vec<u8>, FabricError> {
    let (input, bulk) = wire::split_request(&frame.payload)?;
    let handler = handlers
        .read()
        .ok()
        .and_then(|handlers| handlers.get(&frame.op).cloned().flatten())
        .ok_or(FabricError::NoHandler(frame.op))?;

    let bulk = frame
        .flags
        .contains(FrameFlags::BULK)
        .then(|| Bytes::copy_from_slice(bulk));

    handler
        .handle(IncomingCall {
            op: frame.op,
            input: input.to_vec(),
            bulk,
        })
        .await
        .map_err(|e| FabricError::Handler(e.0))
}

//! In-process fabric.
//!
//! Every instance created from one [`MemoryFabric`] lives on the same hub,
//! so instances can resolve each other's addresses and forward calls
//! without leaving the process. Handlers run on the caller's task and
//! receive bulk regions as the very `Bytes` the sender registered.
//!
//! The hub keeps counters and accepts injected faults so tests can observe
//! how the layers above use the transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use spillway_core::{OpId, Protocol};

use super::{
    BulkDescriptor, Fabric, FabricError, FabricInstance, IncomingCall, InitOptions, OutboundCall,
    RemoteTarget, RpcHandler,
};

type HandlerTable = RwLock<HashMap<OpId, Option<Arc<dyn RpcHandler>>>>;

/// Shared in-process fabric hub. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    hub: Arc<Hub>,
}

/// Snapshot of [`MemoryFabric`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryFabricStats {
    /// Instances initialized and not yet finalized.
    pub instances_live: usize,
    /// Calls to `finalize`, including repeated ones.
    pub finalize_calls: u64,
    /// `finalize` calls on an already finalized instance.
    pub double_finalizes: u64,
    /// Address lookups attempted.
    pub lookups: u64,
    /// Calls forwarded through resolved targets.
    pub forward_attempts: u64,
    /// Resolved targets not yet dropped.
    pub addresses_live: usize,
    /// Bulk regions created.
    pub bulk_created: u64,
    /// Bulk regions released.
    pub bulk_released: u64,
    /// Releases of a region that was not registered.
    pub bulk_double_free: u64,
}

impl MemoryFabricStats {
    /// Bulk regions currently registered.
    pub fn bulk_live(&self) -> u64 {
        self.bulk_created.saturating_sub(self.bulk_released)
    }
}

#[derive(Default)]
struct Hub {
    next_location: AtomicU64,
    next_region: AtomicU64,
    instances: Mutex<HashMap<String, Arc<Listener>>>,
    regions: Mutex<HashMap<u64, Bytes>>,
    faults: Mutex<Faults>,

    instances_live: AtomicUsize,
    finalize_calls: AtomicU64,
    double_finalizes: AtomicU64,
    lookups: AtomicU64,
    forward_attempts: AtomicU64,
    addresses_live: AtomicUsize,
    bulk_created: AtomicU64,
    bulk_released: AtomicU64,
    bulk_double_free: AtomicU64,
}

#[derive(Default)]
struct Faults {
    disabled: HashSet<Protocol>,
    unresolvable: HashSet<String>,
    no_self_address: HashSet<Protocol>,
}

struct Listener {
    handlers: HandlerTable,
}

impl Hub {
    fn faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> Option<T> {
        self.faults.lock().ok().map(|mut faults| f(&mut faults))
    }

    fn listener(&self, address: &str) -> Option<Arc<Listener>> {
        self.instances
            .lock()
            .ok()
            .and_then(|instances| instances.get(address).cloned())
    }
}

impl MemoryFabric {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `init` of `protocol` fail.
    pub fn disable_protocol(&self, protocol: Protocol) {
        self.hub.faults(|f| f.disabled.insert(protocol));
    }

    /// Make every future lookup of `address` fail.
    pub fn fail_lookup(&self, address: impl Into<String>) {
        let address = address.into();
        self.hub.faults(|f| f.unresolvable.insert(address));
    }

    /// Undo [`fail_lookup`](Self::fail_lookup).
    pub fn allow_lookup(&self, address: &str) {
        self.hub.faults(|f| f.unresolvable.remove(address));
    }

    /// Make instances of `protocol` unable to report their own address.
    pub fn fail_self_address(&self, protocol: Protocol) {
        self.hub.faults(|f| f.no_self_address.insert(protocol));
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryFabricStats {
        let hub = &self.hub;
        MemoryFabricStats {
            instances_live: hub.instances_live.load(Ordering::SeqCst),
            finalize_calls: hub.finalize_calls.load(Ordering::SeqCst),
            double_finalizes: hub.double_finalizes.load(Ordering::SeqCst),
            lookups: hub.lookups.load(Ordering::SeqCst),
            forward_attempts: hub.forward_attempts.load(Ordering::SeqCst),
            addresses_live: hub.addresses_live.load(Ordering::SeqCst),
            bulk_created: hub.bulk_created.load(Ordering::SeqCst),
            bulk_released: hub.bulk_released.load(Ordering::SeqCst),
            bulk_double_free: hub.bulk_double_free.load(Ordering::SeqCst),
        }
    }
}

impl Fabric for MemoryFabric {
    fn init(
        &self,
        protocol: Protocol,
        options: &InitOptions,
    ) -> Result<Arc<dyn FabricInstance>, FabricError> {
        let disabled = self
            .hub
            .faults(|f| f.disabled.contains(&protocol))
            .unwrap_or(false);
        if disabled {
            return Err(FabricError::InitFailed {
                protocol,
                reason: "protocol disabled on this hub".to_string(),
            });
        }

        let location = self.hub.next_location.fetch_add(1, Ordering::SeqCst);
        let address = protocol.address(location);
        let listener = Arc::new(Listener {
            handlers: RwLock::new(HashMap::new()),
        });

        self.hub
            .instances
            .lock()
            .map_err(|_| FabricError::InitFailed {
                protocol,
                reason: "hub lock poisoned".to_string(),
            })?
            .insert(address.clone(), Arc::clone(&listener));
        self.hub.instances_live.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            address = %address,
            progress = ?options.progress,
            pool_size = options.pool_size,
            "memory fabric instance initialized"
        );

        Ok(Arc::new(MemoryInstance {
            hub: Arc::clone(&self.hub),
            protocol,
            address,
            listener,
            finalized: AtomicBool::new(false),
        }))
    }
}

struct MemoryInstance {
    hub: Arc<Hub>,
    protocol: Protocol,
    address: String,
    listener: Arc<Listener>,
    finalized: AtomicBool,
}

#[async_trait]
impl FabricInstance for MemoryInstance {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn self_address(&self) -> Result<String, FabricError> {
        let failing = self
            .hub
            .faults(|f| f.no_self_address.contains(&self.protocol))
            .unwrap_or(false);
        if failing {
            return Err(FabricError::NoSelfAddress(format!(
                "{} cannot describe {}",
                self.protocol, self.address
            )));
        }
        Ok(self.address.clone())
    }

    fn register(&self, op: OpId, handler: Option<Arc<dyn RpcHandler>>) {
        if let Ok(mut handlers) = self.listener.handlers.write() {
            handlers.insert(op, handler);
        }
    }

    async fn lookup(&self, address: &str) -> Result<Arc<dyn RemoteTarget>, FabricError> {
        self.hub.lookups.fetch_add(1, Ordering::SeqCst);

        if self.finalized.load(Ordering::SeqCst) {
            return Err(FabricError::Finalized);
        }
        let blocked = self
            .hub
            .faults(|f| f.unresolvable.contains(address))
            .unwrap_or(false);
        if blocked {
            return Err(FabricError::Unreachable {
                address: address.to_string(),
                reason: "lookup failure injected".to_string(),
            });
        }

        match Protocol::split_address(address) {
            Some((protocol, _)) if protocol == self.protocol => {}
            Some((protocol, _)) => {
                return Err(FabricError::Unreachable {
                    address: address.to_string(),
                    reason: format!("{} instance cannot reach {} addresses", self.protocol, protocol),
                })
            }
            None => return Err(FabricError::UnknownAddress(address.to_string())),
        }

        if self.hub.listener(address).is_none() {
            return Err(FabricError::UnknownAddress(address.to_string()));
        }

        self.hub.addresses_live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryTarget {
            hub: Arc::clone(&self.hub),
            address: address.to_string(),
        }))
    }

    fn create_bulk(&self, data: Bytes) -> Result<BulkDescriptor, FabricError> {
        let id = self.hub.next_region.fetch_add(1, Ordering::SeqCst);
        let len = data.len();
        self.hub
            .regions
            .lock()
            .map_err(|_| FabricError::Io("region table poisoned".to_string()))?
            .insert(id, data);
        self.hub.bulk_created.fetch_add(1, Ordering::SeqCst);
        Ok(BulkDescriptor { id, len })
    }

    fn free_bulk(&self, descriptor: BulkDescriptor) {
        let removed = self
            .hub
            .regions
            .lock()
            .ok()
            .and_then(|mut regions| regions.remove(&descriptor.id));
        if removed.is_some() {
            self.hub.bulk_released.fetch_add(1, Ordering::SeqCst);
        } else {
            self.hub.bulk_double_free.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(region = descriptor.id, "bulk region released twice");
        }
    }

    fn finalize(&self) {
        self.hub.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if self.finalized.swap(true, Ordering::SeqCst) {
            self.hub.double_finalizes.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(address = %self.address, "memory fabric instance finalized twice");
            return;
        }
        if let Ok(mut instances) = self.hub.instances.lock() {
            instances.remove(&self.address);
        }
        self.hub.instances_live.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(address = %self.address, "memory fabric instance finalized");
    }
}

struct MemoryTarget {
    hub: Arc<Hub>,
    address: String,
}

impl Drop for MemoryTarget {
    fn drop(&mut self) {
        self.hub.addresses_live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTarget for MemoryTarget {
    fn address(&self) -> &str {
        &self.address
    }

    async fn forward(&self, call: OutboundCall) -> Result<Vec<u8>, FabricError> {
        self.hub.forward_attempts.fetch_add(1, Ordering::SeqCst);

        let listener = self
            .hub
            .listener(&self.address)
            .ok_or_else(|| FabricError::Unreachable {
                address: self.address.clone(),
                reason: "instance finalized".to_string(),
            })?;

        let handler = listener
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&call.op).cloned().flatten())
            .ok_or(FabricError::NoHandler(call.op))?;

        let bulk = match call.bulk {
            Some(descriptor) => Some(
                self.hub
                    .regions
                    .lock()
                    .ok()
                    .and_then(|regions| regions.get(&descriptor.id).cloned())
                    .ok_or(FabricError::RegionReleased(descriptor.id))?,
            ),
            None => None,
        };

        handler
            .handle(IncomingCall {
                op: call.op,
                input: call.input,
                bulk,
            })
            .await
            .map_err(|e| FabricError::Handler(e.0))
    }
}

//! Registry of client processes attached to this server.
//!
//! Clients attach over the local domain and leave their endpoint address
//! behind; the notification protocol asks the registry for that address
//! before calling a client back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::ClientKey;

/// Lookup of attached clients.
pub trait ClientRegistry: Send + Sync {
    /// Local-domain address of the client, if it is attached.
    fn resolve(&self, key: ClientKey) -> Option<String>;
}

/// In-process client registry.
#[derive(Clone, Default)]
pub struct MemoryClientRegistry {
    clients: Arc<RwLock<HashMap<ClientKey, String>>>,
}

impl MemoryClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client and its local-domain address. Returns the address
    /// previously recorded for the key, if any.
    pub fn attach(&self, key: ClientKey, address: impl Into<String>) -> Option<String> {
        let address = address.into();
        tracing::debug!(client = %key, address = %address, "client attached");
        self.clients
            .write()
            .ok()
            .and_then(|mut clients| clients.insert(key, address))
    }

    /// Forget a client. Returns its last known address.
    pub fn detach(&self, key: ClientKey) -> Option<String> {
        tracing::debug!(client = %key, "client detached");
        self.clients
            .write()
            .ok()
            .and_then(|mut clients| clients.remove(&key))
    }

    /// Number of attached clients.
    pub fn len(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether no client is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientRegistry for MemoryClientRegistry {
    fn resolve(&self, key: ClientKey) -> Option<String> {
        self.clients
            .read()
            .ok()
            .and_then(|clients| clients.get(&key).cloned())
    }
}

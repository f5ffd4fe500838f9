//! Operation table: name → [`OpId`] routing for one endpoint.
//!
//! Each endpoint keeps its own table; the local and remote tables never
//! share entries even when both register the same name.

use std::collections::HashMap;

use spillway_core::{Domain, OpId, RpcError, RpcResult};

/// Maps registered operation names to identifiers and back.
#[derive(Debug)]
pub struct OperationTable {
    domain: Domain,
    by_name: HashMap<String, OpId>,
    by_id: HashMap<OpId, String>,
    registration_count: u64,
}

impl OperationTable {
    /// Create an empty table for `domain`.
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            registration_count: 0,
        }
    }

    /// Register `name` and return its identifier.
    ///
    /// # Errors
    ///
    /// - `DuplicateRegistration` if `name` is already registered
    /// - `OperationIdCollision` if another name already holds the identifier
    pub fn insert(&mut self, name: &str) -> RpcResult<OpId> {
        if self.by_name.contains_key(name) {
            return Err(RpcError::DuplicateRegistration {
                domain: self.domain,
                name: name.to_string(),
            });
        }

        let id = OpId::from_name(name);
        if let Some(existing) = self.by_id.get(&id) {
            return Err(RpcError::OperationIdCollision {
                name: name.to_string(),
                existing: existing.clone(),
                id,
            });
        }

        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        self.registration_count += 1;
        Ok(id)
    }

    /// Identifier registered for `name`.
    pub fn get(&self, name: &str) -> Option<OpId> {
        self.by_name.get(name).copied()
    }

    /// Name registered for `id`.
    pub fn name_of(&self, id: OpId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Successful registrations over the table's life.
    pub fn registration_count(&self) -> u64 {
        self.registration_count
    }

    /// Domain this table belongs to.
    pub fn domain(&self) -> Domain {
        self.domain
    }
}

//! Connection manager: peer rank → cached connection.
//!
//! Every rank has a peer record guarded by its own async mutex, so
//! concurrent `connect` calls for one unresolved rank perform a single
//! resolution and share the result, while different ranks resolve in
//! parallel. A peer's address is kept once observed; a failed resolution
//! leaves the record in [`PeerState::Failed`] and the next `connect`
//! retries it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use spillway_core::{Domain, RpcError, RpcResult};
use spillway_transport::{Connection, Endpoint};
use tokio::sync::Mutex;

use crate::directory::AddressDirectory;

/// When peer connections are established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectPolicy {
    /// Connect to every rank right after the remote fence.
    #[default]
    Eager,
    /// Connect to a rank on the first call that needs it.
    Lazy,
}

/// Resolution state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Never resolved.
    Unresolved,
    /// Connection cached.
    Resolved,
    /// Last resolution attempt failed.
    Failed,
}

#[derive(Debug)]
struct PeerRecord {
    address: Option<String>,
    connection: Option<Connection>,
    state: PeerState,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            address: None,
            connection: None,
            state: PeerState::Unresolved,
        }
    }
}

/// Outcome of connecting to every rank.
#[derive(Debug)]
pub struct ConnectReport {
    results: Vec<RpcResult<()>>,
}

impl ConnectReport {
    /// Report for a connect pass that attempted nothing.
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
        }
    }

    /// Per-rank results, indexed by rank.
    pub fn results(&self) -> &[RpcResult<()>] {
        &self.results
    }

    /// Ranks that are connected.
    pub fn connected(&self) -> Vec<usize> {
        self.ranks_where(|r| r.is_ok())
    }

    /// Ranks that could not be connected.
    pub fn failed(&self) -> Vec<usize> {
        self.ranks_where(|r| r.is_err())
    }

    fn ranks_where(&self, pred: impl Fn(&RpcResult<()>) -> bool) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| pred(r))
            .map(|(rank, _)| rank)
            .collect()
    }

    /// Lowest failing rank and its error.
    pub fn first_error(&self) -> Option<(usize, &RpcError)> {
        self.results
            .iter()
            .enumerate()
            .find_map(|(rank, r)| r.as_ref().err().map(|e| (rank, e)))
    }

    /// Aggregate status: the first failure, if any.
    pub fn status(&self) -> RpcResult<()> {
        match self.first_error() {
            Some((_, e)) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Resolves and caches connections to the other servers of the job.
pub struct ConnectionManager {
    domain: Domain,
    policy: ConnectPolicy,
    directory: AddressDirectory,
    peers: Vec<Mutex<PeerRecord>>,
    resolutions: AtomicU64,
}

impl ConnectionManager {
    /// Manager for every rank of the directory's job.
    pub fn new(domain: Domain, policy: ConnectPolicy, directory: AddressDirectory) -> Self {
        let peers = directory
            .job()
            .ranks()
            .map(|_| Mutex::new(PeerRecord::new()))
            .collect();
        Self {
            domain,
            policy,
            directory,
            peers,
            resolutions: AtomicU64::new(0),
        }
    }

    /// Connection policy in effect.
    pub fn policy(&self) -> ConnectPolicy {
        self.policy
    }

    /// Number of address resolutions attempted so far.
    pub fn resolution_count(&self) -> u64 {
        self.resolutions.load(Ordering::SeqCst)
    }

    fn record(&self, rank: usize) -> RpcResult<&Mutex<PeerRecord>> {
        self.peers.get(rank).ok_or(RpcError::InvalidRank {
            rank,
            size: self.peers.len(),
        })
    }

    /// Connection to `rank`, resolving it through `endpoint` on first use.
    ///
    /// # Errors
    ///
    /// - `AddressNotPublished` if the rank has no directory entry
    /// - `ResolutionFailed` if the address cannot be resolved; the peer is
    ///   left in [`PeerState::Failed`]
    pub async fn connect(&self, endpoint: &Endpoint, rank: usize) -> RpcResult<Connection> {
        let mut record = self.record(rank)?.lock().await;
        if let Some(connection) = &record.connection {
            return Ok(connection.clone());
        }

        let address = match &record.address {
            Some(address) => address.clone(),
            None => {
                let address = self.directory.lookup(self.domain, rank).await?;
                record.address = Some(address.clone());
                address
            }
        };

        self.resolutions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(rank, domain = %self.domain, address = %address, "resolving peer");
        match endpoint.lookup(&address).await {
            Ok(connection) => {
                record.connection = Some(connection.clone());
                record.state = PeerState::Resolved;
                tracing::info!(rank, domain = %self.domain, address = %address, "peer connected");
                Ok(connection)
            }
            Err(e) => {
                record.state = PeerState::Failed;
                tracing::warn!(
                    rank,
                    domain = %self.domain,
                    address = %address,
                    error = %e,
                    "peer resolution failed"
                );
                Err(RpcError::ResolutionFailed {
                    domain: self.domain,
                    rank,
                    address,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Connection to `rank` under the configured policy: lazy connects on
    /// demand, eager only returns connections made by
    /// [`connect_all`](Self::connect_all).
    pub async fn get(&self, endpoint: &Endpoint, rank: usize) -> RpcResult<Connection> {
        match self.policy {
            ConnectPolicy::Lazy => self.connect(endpoint, rank).await,
            ConnectPolicy::Eager => self
                .cached(rank)
                .await?
                .ok_or(RpcError::PeerNotConnected { rank }),
        }
    }

    /// Cached connection to `rank`, without resolving.
    pub async fn cached(&self, rank: usize) -> RpcResult<Option<Connection>> {
        Ok(self.record(rank)?.lock().await.connection.clone())
    }

    /// Resolution state of `rank`.
    pub async fn state(&self, rank: usize) -> RpcResult<PeerState> {
        Ok(self.record(rank)?.lock().await.state)
    }

    /// Connect to every rank in ascending order. A failure is recorded and
    /// the remaining ranks are still attempted.
    pub async fn connect_all(&self, endpoint: &Endpoint) -> ConnectReport {
        let mut results = Vec::with_capacity(self.peers.len());
        for rank in 0..self.peers.len() {
            results.push(self.connect(endpoint, rank).await.map(|_| ()));
        }
        let report = ConnectReport { results };
        let failed = report.failed();
        if failed.is_empty() {
            tracing::info!(domain = %self.domain, peers = self.peers.len(), "connected to all peers");
        } else {
            tracing::warn!(domain = %self.domain, ?failed, "some peers could not be connected");
        }
        report
    }

    /// Drop every cached connection. Returns how many were released.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        for slot in &self.peers {
            let mut record = slot.lock().await;
            if record.connection.take().is_some() {
                released += 1;
            }
            record.state = PeerState::Unresolved;
        }
        tracing::debug!(domain = %self.domain, released, "peer connections released");
        released
    }
}

//! Address directory over the cluster key-value store.
//!
//! Each rank publishes one address per domain under
//! `spillway.rpc.<domain>.<rank>`. [`AddressDirectory::fence`] is a
//! collective barrier: every rank must call it, and no rank returns before
//! all of them have published. A rank that never fences blocks the others
//! forever.

use std::sync::Arc;

use spillway_core::{Domain, JobInfo, KeyValueStore, RpcError, RpcResult};

/// Publishes this rank's endpoint addresses and resolves peers'.
#[derive(Clone)]
pub struct AddressDirectory {
    store: Arc<dyn KeyValueStore>,
    job: JobInfo,
}

impl AddressDirectory {
    /// Directory for `job` over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, job: JobInfo) -> Self {
        Self { store, job }
    }

    /// Store key for a rank's address in a domain.
    pub fn key(domain: Domain, rank: usize) -> String {
        format!("spillway.rpc.{}.{}", domain, rank)
    }

    fn fence_scope(domain: Domain) -> String {
        format!("spillway.rpc.{}.fence", domain)
    }

    /// Rank and size of the job this directory serves.
    pub fn job(&self) -> JobInfo {
        self.job
    }

    /// Publish this rank's address. Last writer wins.
    pub async fn publish(&self, domain: Domain, address: &str) -> RpcResult<()> {
        self.store
            .put(&Self::key(domain, self.job.rank), address)
            .await?;
        tracing::info!(rank = self.job.rank, domain = %domain, address, "address published");
        Ok(())
    }

    /// Wait until every rank has published for `domain`.
    pub async fn fence(&self, domain: Domain) -> RpcResult<()> {
        tracing::debug!(rank = self.job.rank, domain = %domain, "entering address fence");
        self.store.barrier(&Self::fence_scope(domain)).await?;
        tracing::debug!(rank = self.job.rank, domain = %domain, "address fence complete");
        Ok(())
    }

    /// Address published by `rank` for `domain`.
    ///
    /// # Errors
    ///
    /// - `InvalidRank` if `rank` is outside the job
    /// - `AddressNotPublished` if the rank has no entry
    pub async fn lookup(&self, domain: Domain, rank: usize) -> RpcResult<String> {
        if rank >= self.job.size {
            return Err(RpcError::InvalidRank {
                rank,
                size: self.job.size,
            });
        }
        match self.store.get(&Self::key(domain, rank)).await? {
            Some(address) => Ok(address),
            None => {
                tracing::debug!(rank, domain = %domain, "peer address not published");
                Err(RpcError::AddressNotPublished { domain, rank })
            }
        }
    }

    /// Remove this rank's entry for `domain`. Other ranks are untouched.
    pub async fn clear(&self, domain: Domain) -> RpcResult<()> {
        self.store
            .remove(&Self::key(domain, self.job.rank))
            .await?;
        tracing::debug!(rank = self.job.rank, domain = %domain, "address cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spillway_core::MemoryKeyValueStore;

    fn directory(store: &MemoryKeyValueStore, rank: usize, size: usize) -> AddressDirectory {
        let job = JobInfo::new(rank, size).expect("rank in job");
        AddressDirectory::new(Arc::new(store.clone()), job)
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            AddressDirectory::key(Domain::Remote, 3),
            "spillway.rpc.remote.3"
        );
        assert_eq!(AddressDirectory::key(Domain::Local, 0), "spillway.rpc.local.0");
    }

    #[tokio::test]
    async fn test_publish_lookup_clear() {
        let store = MemoryKeyValueStore::new(2);
        let zero = directory(&store, 0, 2);
        let one = directory(&store, 1, 2);

        zero.publish(Domain::Remote, "ofi+tcp://10.0.0.1:1")
            .await
            .expect("publish");
        zero.publish(Domain::Remote, "ofi+tcp://10.0.0.1:2")
            .await
            .expect("republish");
        assert_eq!(
            one.lookup(Domain::Remote, 0).await.expect("lookup"),
            "ofi+tcp://10.0.0.1:2"
        );
        assert!(matches!(
            one.lookup(Domain::Local, 0).await,
            Err(RpcError::AddressNotPublished {
                domain: Domain::Local,
                rank: 0
            })
        ));

        one.publish(Domain::Remote, "ofi+tcp://10.0.0.2:1")
            .await
            .expect("publish");
        zero.clear(Domain::Remote).await.expect("clear");
        assert!(one.lookup(Domain::Remote, 0).await.is_err());
        assert!(zero.lookup(Domain::Remote, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_lookup_rejects_rank_outside_job() {
        let store = MemoryKeyValueStore::new(1);
        let only = directory(&store, 0, 1);
        assert!(matches!(
            only.lookup(Domain::Remote, 1).await,
            Err(RpcError::InvalidRank { rank: 1, size: 1 })
        ));
    }

    #[tokio::test]
    async fn test_fence_orders_publish_before_lookup() {
        let size = 4;
        let store = MemoryKeyValueStore::new(size);
        let mut tasks = Vec::new();
        for rank in 0..size {
            let directory = directory(&store, rank, size);
            tasks.push(tokio::spawn(async move {
                // Later ranks publish later; the fence must still cover them.
                for _ in 0..rank {
                    tokio::task::yield_now().await;
                }
                directory
                    .publish(Domain::Remote, &format!("ofi+tcp://node{rank}:4000"))
                    .await?;
                directory.fence(Domain::Remote).await?;
                let mut seen = Vec::new();
                for peer in 0..size {
                    seen.push(directory.lookup(Domain::Remote, peer).await?);
                }
                Ok::<_, RpcError>(seen)
            }));
        }
        for task in tasks {
            let seen = task.await.expect("join").expect("rank");
            assert_eq!(seen.len(), size);
            assert_eq!(seen[2], "ofi+tcp://node2:4000");
        }
    }
}

//! Two ranks talking over the default TCP fabric.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spillway::{RpcConfig, RpcContext, ServiceHandlers};
use spillway_core::{JobInfo, JsonCodec, MemoryClientRegistry, MemoryKeyValueStore, MessageCodec};
use spillway_transport::{handler_fn, HandlerError};

const FILESIZE: &str = "spillway_filesize_rpc";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct FilesizeRequest {
    gfid: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct FilesizeReply {
    gfid: i32,
    size: u64,
}

async fn start(rank: usize, store: &MemoryKeyValueStore) -> RpcContext {
    let handlers = ServiceHandlers::new().with_peer(
        FILESIZE,
        handler_fn(move |call| async move {
            let request: FilesizeRequest = JsonCodec
                .decode(&call.input)
                .map_err(|e| HandlerError(e.to_string()))?;
            JsonCodec
                .encode(&FilesizeReply {
                    gfid: request.gfid,
                    size: 1000 * (rank as u64 + 1),
                })
                .map_err(|e| HandlerError(e.to_string()))
        }),
    );
    RpcContext::builder(
        RpcConfig::testing(),
        JobInfo::new(rank, 2).expect("rank in job"),
        Arc::new(store.clone()),
        Arc::new(MemoryClientRegistry::new()),
    )
    .handlers(handlers)
    .init()
    .await
    .expect("init")
}

#[tokio::test]
async fn test_peer_call_over_tcp() {
    let store = MemoryKeyValueStore::new(2);
    let first = start(0, &store).await;
    let second = start(1, &store).await;
    assert!(first.remote_endpoint().self_address().starts_with("ofi+tcp://"));

    let (a, b) = tokio::join!(first.connect_servers(), second.connect_servers());
    assert_eq!(a.expect("fence").connected(), vec![0, 1]);
    assert_eq!(b.expect("fence").connected(), vec![0, 1]);

    let reply: FilesizeReply = first
        .call_peer(1, FILESIZE, &FilesizeRequest { gfid: 42 })
        .await
        .expect("peer call");
    assert_eq!(reply, FilesizeReply { gfid: 42, size: 2000 });

    let reply: FilesizeReply = second
        .call_peer(0, FILESIZE, &FilesizeRequest { gfid: 7 })
        .await
        .expect("peer call");
    assert_eq!(reply.size, 1000);

    assert!(first.finalize().await.is_clean());
    assert!(second.finalize().await.is_clean());
    assert!(store.is_empty());
}

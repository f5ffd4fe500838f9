//! Client notification delivery through the local endpoint.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spillway::ops;
use spillway::{
    AckOutput, MreadDataInput, Notification, RpcConfig, RpcContext, TransferCompleteInput,
};
use spillway_core::{
    ClientKey, Domain, JobInfo, JsonCodec, MemoryClientRegistry, MemoryKeyValueStore,
    MessageCodec, Protocol, RpcError,
};
use spillway_transport::{
    handler_fn, Endpoint, HandlerError, IncomingCall, InitOptions, MemoryFabric, RpcHandler,
};

const KEY: ClientKey = ClientKey {
    app_id: 11,
    client_id: 3,
};

fn ack(ret: i32) -> Result<Vec<u8>, HandlerError> {
    JsonCodec
        .encode(&AckOutput { ret })
        .map_err(|e| HandlerError(e.to_string()))
}

/// One server rank plus one attached client, sharing a memory fabric.
struct Rig {
    fabric: MemoryFabric,
    registry: MemoryClientRegistry,
    server: RpcContext,
    client: Endpoint,
}

impl Rig {
    async fn new(client_handlers: Vec<(&'static str, Arc<dyn RpcHandler>)>) -> Self {
        let fabric = MemoryFabric::new();
        let registry = MemoryClientRegistry::new();
        let server = RpcContext::builder(
            RpcConfig::testing().with_lazy_connect(true),
            JobInfo::new(0, 1).expect("rank in job"),
            Arc::new(MemoryKeyValueStore::new(1)),
            Arc::new(registry.clone()),
        )
        .fabric(Arc::new(fabric.clone()))
        .init()
        .await
        .expect("server init");

        let mut client = Endpoint::open(
            &fabric,
            Domain::Local,
            &[Protocol::SharedMemory],
            &InitOptions::default(),
        )
        .expect("client endpoint");
        for (name, handler) in client_handlers {
            client.register(name, Some(handler)).expect("register");
        }
        registry.attach(KEY, client.self_address());

        Self {
            fabric,
            registry,
            server,
            client,
        }
    }

    async fn teardown(self) -> MemoryFabric {
        assert!(self.server.finalize().await.is_clean());
        self.client.close();
        let stats = self.fabric.stats();
        assert_eq!(stats.instances_live, 0);
        assert_eq!(stats.double_finalizes, 0);
        assert_eq!(stats.bulk_double_free, 0);
        self.fabric
    }
}

fn mread_data(len: usize) -> Notification {
    Notification::MreadData {
        mread_id: 9,
        read_index: 1,
        offset: 4096,
        data: Bytes::from(vec![0xA5; len]),
    }
}

fn bulk_checking_handler() -> Arc<dyn RpcHandler> {
    handler_fn(|call: IncomingCall| async move {
        let input: MreadDataInput = JsonCodec
            .decode(&call.input)
            .map_err(|e| HandlerError(e.to_string()))?;
        let received = call.bulk.as_ref().map_or(0, Bytes::len);
        if received as u64 != input.bulk_size {
            return ack(-1);
        }
        if call.bulk.iter().any(|b| b.iter().any(|&byte| byte != 0xA5)) {
            return ack(-2);
        }
        ack(received as i32)
    })
}

#[tokio::test]
async fn test_mread_data_bulk_released_after_delivery() {
    let rig = Rig::new(vec![(ops::MREAD_REQ_DATA, bulk_checking_handler())]).await;

    let sizes = [0usize, 1, 4096, 16 * 1024 * 1024];
    for size in sizes {
        let ack = rig
            .server
            .notify(KEY, mread_data(size))
            .await
            .expect("delivered");
        assert_eq!(ack.code(), size as i32);
        assert_eq!(rig.fabric.stats().bulk_live(), 0, "size {size}");
    }

    let stats = rig.fabric.stats();
    assert_eq!(stats.bulk_created, 3);
    assert_eq!(stats.bulk_released, 3);
    rig.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mread_data_bulk_released_on_timeout() {
    let slow = handler_fn(|_call: IncomingCall| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        ack(0)
    });
    let rig = Rig::new(vec![(ops::MREAD_REQ_DATA, slow)]).await;

    for size in [0usize, 1, 4096, 16 * 1024 * 1024] {
        let err = rig
            .server
            .notify(KEY, mread_data(size))
            .await
            .expect_err("client too slow");
        match err {
            RpcError::Timeout { operation, after } => {
                assert_eq!(operation, ops::MREAD_REQ_DATA);
                assert_eq!(after, rig.server.config().client_timeout());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rig.fabric.stats().bulk_live(), 0, "size {size}");
    }

    let stats = rig.fabric.stats();
    assert_eq!(stats.bulk_created, 3);
    assert_eq!(stats.bulk_released, 3);
    rig.teardown().await;
}

#[tokio::test]
async fn test_mread_data_bulk_released_on_handler_failure() {
    let failing = handler_fn(|_call: IncomingCall| async move {
        Err::<Vec<u8>, _>(HandlerError("disk full".to_string()))
    });
    let rig = Rig::new(vec![(ops::MREAD_REQ_DATA, failing)]).await;

    for size in [0usize, 1, 4096, 16 * 1024 * 1024] {
        let err = rig
            .server
            .notify(KEY, mread_data(size))
            .await
            .expect_err("handler failed");
        assert!(matches!(err, RpcError::Transport { .. }), "size {size}");
        assert_eq!(rig.fabric.stats().bulk_live(), 0, "size {size}");
    }

    let stats = rig.fabric.stats();
    assert_eq!(stats.bulk_created, 3);
    assert_eq!(stats.bulk_released, 3);
    rig.teardown().await;
}

#[tokio::test]
async fn test_transfer_complete_returns_client_ack() {
    let handler = handler_fn(|call: IncomingCall| async move {
        let input: TransferCompleteInput = JsonCodec
            .decode(&call.input)
            .map_err(|e| HandlerError(e.to_string()))?;
        if input.app_id != KEY.app_id || input.client_id != KEY.client_id {
            return ack(-1);
        }
        if input.error_code != 0 {
            return ack(input.error_code);
        }
        ack(input.transfer_id * 10 + input.transfer_time_sec as i32)
    });
    let rig = Rig::new(vec![(ops::TRANSFER_COMPLETE, handler)]).await;

    let ack = rig
        .server
        .notify(
            KEY,
            Notification::TransferComplete {
                transfer_id: 4,
                bytes_moved: 1 << 30,
                elapsed: Duration::from_millis(3_250),
                error_code: 0,
            },
        )
        .await
        .expect("delivered");
    assert_eq!(ack.code(), 43);
    assert!(!ack.is_success());

    let ack = rig
        .server
        .notify(
            KEY,
            Notification::TransferComplete {
                transfer_id: 5,
                bytes_moved: 0,
                elapsed: Duration::ZERO,
                error_code: -5,
            },
        )
        .await
        .expect("client-reported failure is still delivered");
    assert_eq!(ack.code(), -5);

    rig.teardown().await;
}

#[tokio::test]
async fn test_heartbeat_and_mread_complete() {
    let rig = Rig::new(vec![
        (ops::HEARTBEAT, handler_fn(|_call: IncomingCall| async move { ack(0) })),
        (
            ops::MREAD_REQ_COMPLETE,
            handler_fn(|_call: IncomingCall| async move { ack(0) }),
        ),
    ])
    .await;

    assert!(rig
        .server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect("heartbeat")
        .is_success());
    assert!(rig
        .server
        .notify(
            KEY,
            Notification::MreadComplete {
                mread_id: 9,
                read_index: 0,
                error_code: 0,
            },
        )
        .await
        .expect("mread complete")
        .is_success());

    // Second notification reused the cached client connection.
    assert_eq!(rig.fabric.stats().lookups, 1);
    assert_eq!(rig.fabric.stats().bulk_created, 0);
    rig.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unlink_callback_waits_past_client_timeout() {
    let slow = handler_fn(|_call: IncomingCall| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ack(0)
    });
    let rig = Rig::new(vec![(ops::UNLINK_CALLBACK, slow)]).await;

    let ack = rig
        .server
        .notify(KEY, Notification::UnlinkCallback { gfid: 77 })
        .await
        .expect("untimed");
    assert!(ack.is_success());
    rig.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_hung_unlink_callback() {
    let hung = handler_fn(|_call: IncomingCall| async move {
        std::future::pending::<()>().await;
        ack(0)
    });
    let rig = Rig::new(vec![(ops::UNLINK_CALLBACK, hung)]).await;
    let deadline = rig.server.config().drain_timeout();

    let started = tokio::time::Instant::now();
    let abandoned = tokio::select! {
        _ = rig.server.notify(KEY, Notification::UnlinkCallback { gfid: 5 }) => {
            panic!("unlink callback has no timeout")
        }
        abandoned = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rig.server.shutdown().await
        } => abandoned,
    };
    assert_eq!(abandoned, 1);
    assert!(started.elapsed() >= deadline);

    let Rig {
        fabric,
        server,
        client,
        ..
    } = rig;
    let report = server.finalize().await;
    assert_eq!(report.calls_abandoned, 1);
    assert!(report.failures().is_empty());
    assert!(!report.is_clean());
    client.close();
    assert_eq!(fabric.stats().instances_live, 0);
}

#[tokio::test]
async fn test_unknown_client_never_reaches_transport() {
    let rig = Rig::new(vec![(ops::HEARTBEAT, handler_fn(|_call: IncomingCall| async move { ack(0) }))]).await;
    rig.registry.detach(KEY);
    let before = rig.fabric.stats();

    let err = rig
        .server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect_err("detached");
    assert!(matches!(err, RpcError::ClientNotFound { key } if key == KEY));

    let after = rig.fabric.stats();
    assert_eq!(after.lookups, before.lookups);
    assert_eq!(after.forward_attempts, before.forward_attempts);
    assert_eq!(after.lookups, 0);
    assert_eq!(after.forward_attempts, 0);
    rig.teardown().await;
}

#[tokio::test]
async fn test_unresolvable_client_is_not_found() {
    let rig = Rig::new(vec![(ops::HEARTBEAT, handler_fn(|_call: IncomingCall| async move { ack(0) }))]).await;
    rig.fabric.fail_lookup(rig.client.self_address());

    let err = rig
        .server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect_err("unresolvable");
    assert!(matches!(err, RpcError::ClientNotFound { .. }));
    assert_eq!(rig.fabric.stats().forward_attempts, 0);

    rig.fabric.allow_lookup(rig.client.self_address());
    assert!(rig
        .server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect("resolvable again")
        .is_success());
    rig.teardown().await;
}

#[tokio::test]
async fn test_transport_failure_drops_cached_client() {
    let rig = Rig::new(vec![(ops::HEARTBEAT, handler_fn(|_call: IncomingCall| async move { ack(0) }))]).await;

    rig.server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect("first heartbeat");
    assert_eq!(rig.fabric.stats().lookups, 1);

    // The client never registered a mread-complete handler.
    let err = rig
        .server
        .notify(
            KEY,
            Notification::MreadComplete {
                mread_id: 1,
                read_index: 0,
                error_code: 0,
            },
        )
        .await
        .expect_err("no handler");
    assert!(matches!(err, RpcError::Transport { .. }));
    assert!(!rig.server.forget_client(KEY));

    rig.server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect("heartbeat after eviction");
    assert_eq!(rig.fabric.stats().lookups, 2);
    rig.teardown().await;
}

#[tokio::test]
async fn test_notify_after_shutdown_is_refused() {
    let rig = Rig::new(vec![(ops::HEARTBEAT, handler_fn(|_call: IncomingCall| async move { ack(0) }))]).await;
    rig.server.shutdown().await;

    let err = rig
        .server
        .notify(KEY, Notification::Heartbeat)
        .await
        .expect_err("shut down");
    assert!(matches!(err, RpcError::ShuttingDown));
    assert_eq!(rig.fabric.stats().lookups, 0);
    rig.teardown().await;
}

mod common;

use std::time::Duration;

use mqrpc::broker::QueueSpec;
use mqrpc::{
    Broker, BrokerError, CallMode, MemoryBroker, MethodRegistry, RpcConfig, RpcError, RpcResult,
    RpcServer,
};
use serde_json::{json, Value};

use common::{server_config, shared};

async fn ok(_: Value) -> anyhow::Result<RpcResult> {
    Ok(RpcResult::success(json!({})))
}

fn registry() -> MethodRegistry {
    let mut builder = MethodRegistry::builder();
    builder
        .register(CallMode::Sync, "inventory", "count", true, ok)
        .expect("register sync")
        .register(CallMode::Async, "inventory", "restock", true, ok)
        .expect("register async");
    builder.build()
}

#[tokio::test]
async fn start_declares_queues_and_spawns_consumers() {
    let broker = MemoryBroker::new();
    let mut config = server_config(3);
    config.rpcs.push(mqrpc::RpcDefinition {
        name: "inventory".into(),
        ttl_ms: Some(5_000),
        consumers: Some(2),
    });

    let server = RpcServer::new(shared(&broker), registry(), config);
    let handle = server.start().await.expect("start");
    assert_eq!(handle.consumer_count(), 4);
    assert!(broker.queue_exists("inventory"));
    assert!(broker.queue_exists("inventory.async"));
    assert!(!broker.queue_exists("inventory.delayed"));

    // Restarting against the same broker is idempotent.
    let again = server.start().await.expect("second start");
    again.shutdown().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn conflicting_topology_refuses_to_start() {
    let broker = MemoryBroker::new();
    broker
        .declare_queue(
            &QueueSpec::durable("inventory").with_message_ttl(Some(Duration::from_secs(60))),
        )
        .await
        .expect("pre-declare");

    let err = RpcServer::new(shared(&broker), registry(), server_config(1))
        .start()
        .await
        .err()
        .expect("ttl mismatch");
    assert!(matches!(err, RpcError::Topology(BrokerError::PreconditionFailed { .. })));
    assert_eq!(broker.unacked_count("inventory"), Some(0));
}

#[tokio::test]
async fn invalid_config_refuses_to_start() {
    let broker = MemoryBroker::new();
    let err = RpcServer::new(shared(&broker), registry(), server_config(0))
        .start()
        .await
        .err()
        .expect("zero consumers");
    assert!(matches!(err, RpcError::Config { .. }));
    assert!(!broker.queue_exists("inventory"));
}

#[test]
fn duplicate_registration_is_fatal() {
    let mut builder = MethodRegistry::builder();
    builder.register(CallMode::Sync, "inventory", "count", false, ok).expect("first");
    let err = builder
        .register(CallMode::Sync, "inventory", "count", true, ok)
        .expect_err("second registration");
    assert_eq!(err.to_string(), "duplicate registration: sync inventory/count");
}

#[test]
fn config_loads_from_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mqrpc.toml");
    std::fs::write(
        &path,
        "[client]\nreply_timeout_ms = 250\n\n[[rpc]]\nname = \"inventory\"\nconsumers = 6\n",
    )
    .expect("write");

    let config = RpcConfig::from_path(&path).expect("load");
    assert_eq!(config.client.reply_timeout(), Duration::from_millis(250));
    assert_eq!(config.consumers_for("inventory"), 6);

    std::fs::write(&path, "[client]\nreply_timeout_ms = \"soon\"\n").expect("write");
    let err = RpcConfig::from_path(&path).expect_err("bad value");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

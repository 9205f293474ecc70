#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mqrpc::{
    Broker, ClientConfig, MemoryBroker, MethodRegistry, RpcConfig, RpcServer, ServerHandle,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn client_config(reply_timeout_ms: u64, max_attempts: u32) -> ClientConfig {
    ClientConfig {
        reply_timeout_ms,
        max_attempts,
        retry_interval_ms: 20,
        ..ClientConfig::default()
    }
}

pub fn server_config(consumers: usize) -> RpcConfig {
    let mut config = RpcConfig::default();
    config.server.consumers = consumers;
    config
}

pub fn shared(broker: &MemoryBroker) -> Arc<dyn Broker> {
    Arc::new(broker.clone())
}

pub async fn start(
    broker: &MemoryBroker,
    registry: MethodRegistry,
    config: RpcConfig,
) -> ServerHandle {
    RpcServer::new(shared(broker), registry, config).start().await.expect("server start")
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `queue` has no ready and no unacknowledged messages.
pub async fn drained(broker: &MemoryBroker, queue: &str) -> bool {
    eventually(Duration::from_secs(2), move || async move {
        broker.ready_count(queue) == Some(0) && broker.unacked_count(queue) == Some(0)
    })
    .await
}

//! Runs in its own test binary: it installs a process-wide capturing logger.

mod common;

use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};
use mqrpc::dispatcher::LOG_TARGET;
use mqrpc::topology::REPLY_EXCHANGE;
use mqrpc::{AsyncInvoker, CallMode, MemoryBroker, MethodRegistry, RpcResult};
use serde_json::{json, Value};

use common::{client_config, server_config, shared, start};

struct CapturedRecord {
    target: String,
    level: Level,
    message: String,
}

struct CaptureLogger {
    records: Mutex<Vec<CapturedRecord>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.records.lock().expect("capture mutex poisoned").push(CapturedRecord {
            target: record.target().to_string(),
            level: record.level(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

static CAPTURE: CaptureLogger = CaptureLogger { records: Mutex::new(Vec::new()) };

async fn record(_: Value) -> anyhow::Result<RpcResult> {
    Ok(RpcResult::success(json!({})))
}

#[tokio::test]
async fn unknown_async_command_logs_once_and_sends_nothing_back() {
    log::set_logger(&CAPTURE).expect("install capture logger");
    log::set_max_level(LevelFilter::Trace);

    let mut builder = MethodRegistry::builder();
    builder.register(CallMode::Async, "audit", "record", true, record).expect("register");
    let broker = MemoryBroker::new();
    let server = start(&broker, builder.build(), server_config(2)).await;
    let invoker = AsyncInvoker::connect(shared(&broker), "audit", client_config(1_000, 1))
        .await
        .expect("invoker");

    invoker
        .send("purge_everything", json!({"scope": "all"}))
        .await
        .expect("unknown commands are not a client error");
    assert!(common::drained(&broker, "audit.async").await);
    server.shutdown().await;

    let records = CAPTURE.records.lock().expect("capture mutex poisoned");
    let about_command: Vec<&CapturedRecord> = records
        .iter()
        .filter(|r| r.target == LOG_TARGET && r.message.contains("purge_everything"))
        .collect();
    assert_eq!(about_command.len(), 1, "exactly one dispatcher entry for the unknown command");
    assert!(about_command[0].level <= Level::Warn);
    assert_eq!(broker.published_count(REPLY_EXCHANGE), 0);
}

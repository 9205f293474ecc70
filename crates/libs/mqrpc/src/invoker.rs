//! Client side: SYNC calls with timeout and retry, ASYNC and DELAYED sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mqrpc_broker::{Broker, BrokerError, Consumer, MessageProperties};
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, ReplyEnvelope, CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON};
use crate::config::ClientConfig;
use crate::error::{code, RpcError};
use crate::topology::{
    exchange_spec, reply_queue_name, resolve, Route, TopologyDeclarer, TopologyPlan,
};
use crate::types::{CallMode, CorrelationId, RpcName, RpcResult};

pub const LOG_TARGET: &str = "mqrpc::invoker";

/// Random lowercase hex string of `bytes` random bytes.
pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn request_properties() -> MessageProperties {
    MessageProperties::default()
        .with_content_type(CONTENT_TYPE_JSON)
        .with_content_encoding(CONTENT_ENCODING_UTF8)
}

type PendingMap = HashMap<CorrelationId, oneshot::Sender<ReplyEnvelope>>;

#[derive(Default)]
struct PendingCalls {
    calls: Mutex<PendingMap>,
}

impl PendingCalls {
    fn register(&self, correlation_id: &str) -> oneshot::Receiver<ReplyEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    /// Hand `reply` to the waiting call. Returns `false` when nobody is
    /// waiting for `correlation_id` any more.
    fn resolve(&self, correlation_id: &str, reply: ReplyEnvelope) -> bool {
        match self.lock().remove(correlation_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    fn forget(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.calls.lock().expect("pending calls mutex poisoned")
    }
}

/// Removes the pending entry however the attempt ends, including when the
/// caller drops the call future.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.forget(&self.correlation_id);
    }
}

/// Request/reply client for one RPC name.
///
/// Owns a private auto-delete reply queue and a background task resolving
/// replies by correlation id. Dropping the invoker stops that task, which
/// releases the reply queue.
pub struct SyncInvoker {
    rpc_name: RpcName,
    route: Route,
    reply_queue: String,
    broker: Arc<dyn Broker>,
    config: ClientConfig,
    pending: Arc<PendingCalls>,
    cancel: CancellationToken,
}

impl SyncInvoker {
    pub async fn connect(
        broker: Arc<dyn Broker>,
        rpc_name: &str,
        config: ClientConfig,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let reply_queue = reply_queue_name(rpc_name, &random_hex(8));

        let mut plan = TopologyPlan::new();
        plan.exchange(exchange_spec(CallMode::Sync)).reply_queue(&reply_queue);
        TopologyDeclarer::new(broker.clone()).ensure(&plan).await?;

        let consumer = broker.consume(&reply_queue, &reply_queue).await?;
        let pending = Arc::new(PendingCalls::default());
        let cancel = CancellationToken::new();
        tokio::spawn(drain_replies(
            consumer,
            pending.clone(),
            cancel.clone(),
            rpc_name.to_string(),
        ));

        log::debug!(target: LOG_TARGET, "invoker({rpc_name}): replies on {reply_queue}");
        Ok(Self {
            rpc_name: rpc_name.to_string(),
            route: resolve(rpc_name, CallMode::Sync),
            reply_queue,
            broker,
            config,
            pending,
            cancel,
        })
    }

    pub fn rpc_name(&self) -> &str {
        &self.rpc_name
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Invoke `command` and wait for its result.
    ///
    /// `NOT_FOUND` and `FAILURE` replies are `Ok`; only timeouts (after all
    /// attempts) and transport problems are `Err`.
    pub async fn call(&self, command: &str, data: Value) -> Result<RpcResult, RpcError> {
        let body = codec::encode_request(command, &data)?;
        let attempts = self.config.max_attempts.max(1);
        let started = Instant::now();

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_interval()).await;
            }
            match self.attempt(command, body.clone()).await {
                Ok(reply) => {
                    self.log_elapsed(command, started.elapsed());
                    return Ok(reply.into());
                }
                Err(err) if err.is_retryable() => {
                    log::debug!(
                        target: LOG_TARGET,
                        "invoker({}): {command} attempt {attempt}/{attempts} failed: {err}",
                        self.rpc_name
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        self.log_elapsed(command, started.elapsed());
        match last_error {
            Some(RpcError::Transport(err)) => Err(RpcError::Transport(err)),
            _ => Err(RpcError::Timeout {
                rpc_name: self.rpc_name.clone(),
                command: command.to_string(),
                attempts,
            }),
        }
    }

    /// Serialize `request`, call, and decode the success payload. Non-success
    /// replies become [`RpcError::Remote`].
    pub async fn call_typed<Req, Resp>(
        &self,
        command: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(request)?;
        self.call(command, data).await?.into_payload()
    }

    async fn attempt(&self, command: &str, body: Vec<u8>) -> Result<ReplyEnvelope, RpcError> {
        let correlation_id = random_hex(16);
        let reply = self.pending.register(&correlation_id);
        let _guard =
            PendingGuard { pending: &self.pending, correlation_id: correlation_id.clone() };

        let properties = request_properties()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(self.reply_queue.as_str());
        self.broker
            .publish(&self.route.exchange, &self.route.routing_key, properties, body)
            .await?;

        match tokio::time::timeout(self.config.reply_timeout(), reply).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(RpcError::Transport(BrokerError::Closed)),
            Err(_) => Err(RpcError::Timeout {
                rpc_name: self.rpc_name.clone(),
                command: command.to_string(),
                attempts: 1,
            }),
        }
    }

    fn log_elapsed(&self, command: &str, elapsed: Duration) {
        if elapsed > self.config.slow_call_threshold() {
            log::warn!(
                target: LOG_TARGET,
                "invoker({}): slow call {command} took {elapsed:?}",
                self.rpc_name
            );
        } else {
            log::debug!(
                target: LOG_TARGET,
                "invoker({}): call {command} took {elapsed:?}",
                self.rpc_name
            );
        }
    }
}

impl Drop for SyncInvoker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain_replies(
    mut consumer: Box<dyn Consumer>,
    pending: Arc<PendingCalls>,
    cancel: CancellationToken,
    rpc_name: RpcName,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else {
            log::warn!(target: LOG_TARGET, "invoker({rpc_name}): reply queue closed");
            break;
        };
        if let Err(err) = consumer.ack(delivery.delivery_tag).await {
            log::warn!(target: LOG_TARGET, "invoker({rpc_name}): reply ack failed: {err}");
        }

        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            log::debug!(target: LOG_TARGET, "invoker({rpc_name}): reply without correlation id");
            continue;
        };
        let envelope = match codec::decode_reply(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "invoker({rpc_name}): undecodable reply {correlation_id}: {err}"
                );
                ReplyEnvelope::from(RpcResult::failure(
                    code::INTERNAL,
                    format!("undecodable reply: {err}"),
                ))
            }
        };
        if !pending.resolve(correlation_id, envelope) {
            log::debug!(
                target: LOG_TARGET,
                "invoker({rpc_name}): discarding late or unknown reply {correlation_id}"
            );
        }
    }
    pending.clear();
}

/// Fire-and-forget client for one RPC name.
#[derive(Clone)]
pub struct AsyncInvoker {
    rpc_name: RpcName,
    broker: Arc<dyn Broker>,
    config: ClientConfig,
}

impl AsyncInvoker {
    pub async fn connect(
        broker: Arc<dyn Broker>,
        rpc_name: &str,
        config: ClientConfig,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let mut plan = TopologyPlan::new();
        plan.exchange(exchange_spec(CallMode::Async)).exchange(exchange_spec(CallMode::Delayed));
        TopologyDeclarer::new(broker.clone()).ensure(&plan).await?;
        Ok(Self { rpc_name: rpc_name.to_string(), broker, config })
    }

    pub fn rpc_name(&self) -> &str {
        &self.rpc_name
    }

    /// Publish `command` and return once the broker accepted it.
    pub async fn send(&self, command: &str, data: Value) -> Result<(), RpcError> {
        self.publish(CallMode::Async, command, &data, None).await
    }

    /// Publish `command` for delivery after `delay`.
    pub async fn send_delayed(
        &self,
        command: &str,
        data: Value,
        delay: Duration,
    ) -> Result<(), RpcError> {
        self.publish(CallMode::Delayed, command, &data, Some(delay)).await
    }

    pub async fn send_typed<Req>(&self, command: &str, request: &Req) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let data = serde_json::to_value(request)?;
        self.publish(CallMode::Async, command, &data, None).await
    }

    pub async fn send_delayed_typed<Req>(
        &self,
        command: &str,
        request: &Req,
        delay: Duration,
    ) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let data = serde_json::to_value(request)?;
        self.publish(CallMode::Delayed, command, &data, Some(delay)).await
    }

    async fn publish(
        &self,
        mode: CallMode,
        command: &str,
        data: &Value,
        delay: Option<Duration>,
    ) -> Result<(), RpcError> {
        let route = resolve(&self.rpc_name, mode);
        let body = codec::encode_request(command, data)?;
        let mut properties = request_properties().with_message_id(random_hex(16));
        properties.delay = delay;

        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self
                .broker
                .publish(&route.exchange, &route.routing_key, properties.clone(), body.clone())
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    log::debug!(
                        target: LOG_TARGET,
                        "invoker({}): {mode} {command} publish attempt {attempt} failed: {err}",
                        self.rpc_name
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplyStatus;
    use serde_json::json;

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = random_hex(16);
        let b = random_hex(16);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn pending_calls_resolve_once() {
        let pending = PendingCalls::default();
        let rx = pending.register("c-1");
        let reply = ReplyEnvelope::from(RpcResult::success(json!({"n": 1})));

        assert!(pending.resolve("c-1", reply.clone()));
        assert!(!pending.resolve("c-1", reply.clone()), "second reply is discarded");
        assert!(!pending.resolve("unknown", reply));
        assert_eq!(rx.await.expect("reply").status, ReplyStatus::Success);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn guard_forgets_abandoned_calls() {
        let pending = PendingCalls::default();
        let rx = pending.register("c-1");
        {
            let _guard = PendingGuard { pending: &pending, correlation_id: "c-1".into() };
            assert_eq!(pending.len(), 1);
        }
        assert_eq!(pending.len(), 0);
        assert!(rx.await.is_err());
    }
}

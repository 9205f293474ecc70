//! Per-message server pipeline: decode, look up, de-duplicate, validate,
//! invoke and (SYNC only) reply.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use mqrpc_broker::{Broker, Delivery, MessageProperties};

use crate::codec::{
    self, ReplyEnvelope, RequestEnvelope, CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON,
};
use crate::error::code;
use crate::interceptor::{CallContext, DuplicateInterceptor};
use crate::registry::MethodRegistry;
use crate::topology::REPLY_EXCHANGE;
use crate::types::{CallMode, ReplyStatus, RpcName, RpcResult};

pub const LOG_TARGET: &str = "mqrpc::dispatcher";

const GENERIC_FAILURE: &str = "internal error while handling the call";

/// What happened to one delivery. The delivery is acknowledged in every case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A SYNC reply with this status was published.
    Replied(ReplyStatus),
    /// An ASYNC or DELAYED handler ran to completion.
    Completed,
    /// Nothing was replied; the reason was logged.
    Dropped(DropReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NotFound,
    Duplicate,
    Invalid,
    HandlerFailed,
    ReplyFailed,
    MissingReplyTo,
}

/// Message pipeline for one request queue. Cheap to clone; all consumer
/// tasks of a queue share the same registry and interceptor.
#[derive(Clone)]
pub struct Dispatcher {
    rpc_name: RpcName,
    mode: CallMode,
    registry: Arc<MethodRegistry>,
    interceptor: Arc<dyn DuplicateInterceptor>,
    broker: Arc<dyn Broker>,
    slow_call_threshold: Duration,
}

impl Dispatcher {
    pub fn new(
        rpc_name: impl Into<RpcName>,
        mode: CallMode,
        registry: Arc<MethodRegistry>,
        interceptor: Arc<dyn DuplicateInterceptor>,
        broker: Arc<dyn Broker>,
        slow_call_threshold: Duration,
    ) -> Self {
        Self {
            rpc_name: rpc_name.into(),
            mode,
            registry,
            interceptor,
            broker,
            slow_call_threshold,
        }
    }

    pub fn rpc_name(&self) -> &str {
        &self.rpc_name
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    /// Process one delivery. Never fails and never panics; the caller acks
    /// the delivery afterwards regardless of the outcome.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        match AssertUnwindSafe(self.process(delivery)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                log::error!(
                    target: LOG_TARGET,
                    "dispatcher({}): {} delivery {} aborted: {}",
                    self.rpc_name,
                    self.mode,
                    delivery.delivery_tag,
                    panic_message(panic.as_ref())
                );
                self.fail(delivery).await
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> DispatchOutcome {
        let envelope = match codec::decode_request(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!(
                    target: LOG_TARGET,
                    "dispatcher({}): dropping malformed {} request: {err}",
                    self.rpc_name,
                    self.mode
                );
                return DispatchOutcome::Dropped(DropReason::Malformed);
            }
        };

        let Some(binding) = self.registry.get(self.mode, &self.rpc_name, &envelope.command) else {
            let result = RpcResult::not_found(format!(
                "no {} handler for {}/{}",
                self.mode, self.rpc_name, envelope.command
            ));
            return self.reject(delivery, &envelope, result, DropReason::NotFound).await;
        };

        let props = &delivery.properties;
        let ctx = CallContext {
            rpc_name: self.rpc_name.clone(),
            mode: self.mode,
            command: envelope.command.clone(),
            call_id: props.correlation_id.clone().or_else(|| props.message_id.clone()),
        };
        if self.interceptor.is_duplicate_call(&ctx).await
            || (!binding.allow_duplicate()
                && self.interceptor.is_duplicate_content(&ctx, &envelope.data).await)
        {
            let result = RpcResult::failure(code::DUPLICATE, "duplicate call rejected");
            return self.reject(delivery, &envelope, result, DropReason::Duplicate).await;
        }

        let data = envelope.data.clone();
        let pending = match catch_unwind(AssertUnwindSafe(|| binding.prepare(data))) {
            Ok(Ok(pending)) => pending,
            Ok(Err(violations)) => {
                let result = RpcResult::failure(code::VALIDATION, violations.join("; "));
                return self.reject(delivery, &envelope, result, DropReason::Invalid).await;
            }
            Err(panic) => {
                self.log_handler_failure(&envelope, &panic_message(panic.as_ref()));
                return self.fail(delivery).await;
            }
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(pending).catch_unwind().await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_call_threshold {
            log::warn!(
                target: LOG_TARGET,
                "dispatcher({}): slow {} call {} took {elapsed:?}",
                self.rpc_name,
                self.mode,
                envelope.command
            );
        } else {
            log::debug!(
                target: LOG_TARGET,
                "dispatcher({}): {} call {} took {elapsed:?}",
                self.rpc_name,
                self.mode,
                envelope.command
            );
        }

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                self.log_handler_failure(&envelope, &format!("{err:#}"));
                return self.fail(delivery).await;
            }
            Err(panic) => {
                self.log_handler_failure(&envelope, &panic_message(panic.as_ref()));
                return self.fail(delivery).await;
            }
        };

        if self.mode.expects_reply() {
            self.reply(delivery, result).await
        } else {
            DispatchOutcome::Completed
        }
    }

    /// SYNC: reply with `result`. ASYNC: log once and drop.
    async fn reject(
        &self,
        delivery: &Delivery,
        envelope: &RequestEnvelope,
        result: RpcResult,
        reason: DropReason,
    ) -> DispatchOutcome {
        if self.mode.expects_reply() {
            return self.reply(delivery, result).await;
        }
        log::warn!(
            target: LOG_TARGET,
            "dispatcher({}): {} call {} dropped: {}",
            self.rpc_name,
            self.mode,
            envelope.command,
            result.message
        );
        DispatchOutcome::Dropped(reason)
    }

    async fn fail(&self, delivery: &Delivery) -> DispatchOutcome {
        if self.mode.expects_reply() {
            self.reply(delivery, RpcResult::failure(code::INTERNAL, GENERIC_FAILURE)).await
        } else {
            DispatchOutcome::Dropped(DropReason::HandlerFailed)
        }
    }

    fn log_handler_failure(&self, envelope: &RequestEnvelope, reason: &str) {
        log::error!(
            target: LOG_TARGET,
            "dispatcher({}): {} handler {} failed: {reason} envelope={}",
            self.rpc_name,
            self.mode,
            envelope.command,
            serde_json::to_string(envelope).unwrap_or_else(|_| envelope.data.to_string())
        );
    }

    async fn reply(&self, delivery: &Delivery, result: RpcResult) -> DispatchOutcome {
        let status = result.status;
        let inbound = &delivery.properties;
        let Some(reply_to) = inbound.reply_to.as_deref() else {
            log::warn!(
                target: LOG_TARGET,
                "dispatcher({}): sync request without reply_to, {status:?} reply dropped",
                self.rpc_name
            );
            return DispatchOutcome::Dropped(DropReason::MissingReplyTo);
        };

        let body = match codec::encode_reply(&ReplyEnvelope::from(result)) {
            Ok(body) => body,
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "dispatcher({}): failed to encode reply: {err}",
                    self.rpc_name
                );
                return DispatchOutcome::Dropped(DropReason::ReplyFailed);
            }
        };

        let properties = MessageProperties {
            correlation_id: inbound.correlation_id.clone(),
            content_type: Some(
                inbound.content_type.clone().unwrap_or_else(|| CONTENT_TYPE_JSON.to_string()),
            ),
            content_encoding: Some(
                inbound
                    .content_encoding
                    .clone()
                    .unwrap_or_else(|| CONTENT_ENCODING_UTF8.to_string()),
            ),
            ..MessageProperties::default()
        };

        match self.broker.publish(REPLY_EXCHANGE, reply_to, properties, body).await {
            Ok(()) => DispatchOutcome::Replied(status),
            Err(err) => {
                log::error!(
                    target: LOG_TARGET,
                    "dispatcher({}): reply to {reply_to} failed: {err}",
                    self.rpc_name
                );
                DispatchOutcome::Dropped(DropReason::ReplyFailed)
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

//! Naming of broker objects per RPC and the idempotent "ensure topology" step.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mqrpc_broker::{BindingSpec, Broker, ExchangeSpec, QueueSpec};

use crate::error::RpcError;
use crate::types::CallMode;

pub const SYNC_EXCHANGE: &str = "mqrpc.sync";
pub const ASYNC_EXCHANGE: &str = "mqrpc.async";
pub const DELAYED_EXCHANGE: &str = "mqrpc.delayed";
pub const REPLY_EXCHANGE: &str = "mqrpc.reply";

const ASYNC_SUFFIX: &str = ".async";
const DELAYED_SUFFIX: &str = ".delayed";
const REPLY_INFIX: &str = ".reply.";

/// Where requests for one `(rpc name, mode)` pair are published and consumed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Derive the canonical route for `rpc_name` in `mode`.
pub fn resolve(rpc_name: &str, mode: CallMode) -> Route {
    let (queue, exchange) = match mode {
        CallMode::Sync => (rpc_name.to_string(), SYNC_EXCHANGE),
        CallMode::Async => (format!("{rpc_name}{ASYNC_SUFFIX}"), ASYNC_EXCHANGE),
        CallMode::Delayed => (format!("{rpc_name}{DELAYED_SUFFIX}"), DELAYED_EXCHANGE),
    };
    Route { routing_key: queue.clone(), queue, exchange: exchange.to_string() }
}

pub fn reply_queue_name(rpc_name: &str, instance_suffix: &str) -> String {
    format!("{rpc_name}{REPLY_INFIX}{instance_suffix}")
}

pub fn exchange_spec(mode: CallMode) -> ExchangeSpec {
    match mode {
        CallMode::Sync => ExchangeSpec::direct(SYNC_EXCHANGE),
        CallMode::Async => ExchangeSpec::direct(ASYNC_EXCHANGE),
        CallMode::Delayed => ExchangeSpec::delayed(DELAYED_EXCHANGE),
    }
}

pub fn reply_exchange_spec() -> ExchangeSpec {
    ExchangeSpec::direct(REPLY_EXCHANGE)
}

/// Request queue definition. Only SYNC queues carry a message TTL: a request
/// nobody picked up before the caller gave up is not worth processing.
pub fn request_queue_spec(rpc_name: &str, mode: CallMode, ttl: Option<Duration>) -> QueueSpec {
    let route = resolve(rpc_name, mode);
    let ttl = if mode == CallMode::Sync { ttl } else { None };
    QueueSpec::durable(route.queue).with_message_ttl(ttl)
}

/// Declarative description of the broker objects a component needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<BindingSpec>,
}

impl TopologyPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(&mut self, spec: ExchangeSpec) -> &mut Self {
        if !self.exchanges.contains(&spec) {
            self.exchanges.push(spec);
        }
        self
    }

    /// Request exchange, queue and binding for one route.
    pub fn request_route(
        &mut self,
        rpc_name: &str,
        mode: CallMode,
        ttl: Option<Duration>,
    ) -> &mut Self {
        let route = resolve(rpc_name, mode);
        self.exchange(exchange_spec(mode));
        self.queues.push(request_queue_spec(rpc_name, mode, ttl));
        self.bindings.push(BindingSpec::new(route.queue, route.exchange, route.routing_key));
        self
    }

    /// A private auto-delete reply queue bound to the reply exchange.
    pub fn reply_queue(&mut self, queue: &str) -> &mut Self {
        self.exchange(reply_exchange_spec());
        self.queues.push(QueueSpec::transient(queue));
        self.bindings.push(BindingSpec::new(queue, REPLY_EXCHANGE, queue));
        self
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Declared {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
}

/// Declares plans against a broker, remembering exact definitions so each
/// object is sent to the broker once. A definition that differs from one
/// already on the broker is not in the cache and reaches the broker, which
/// rejects it.
pub struct TopologyDeclarer {
    broker: Arc<dyn Broker>,
    declared: Mutex<HashSet<Declared>>,
}

impl TopologyDeclarer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker, declared: Mutex::new(HashSet::new()) }
    }

    pub async fn ensure(&self, plan: &TopologyPlan) -> Result<(), RpcError> {
        for spec in plan.exchanges() {
            let entry = Declared::Exchange(spec.clone());
            if self.is_declared(&entry) {
                continue;
            }
            self.broker.declare_exchange(spec).await.map_err(|err| {
                log::error!("topology: exchange {} rejected: {err}", spec.name);
                RpcError::Topology(err)
            })?;
            self.mark_declared(entry);
        }

        for spec in plan.queues() {
            let entry = Declared::Queue(spec.clone());
            if self.is_declared(&entry) {
                continue;
            }
            self.broker.declare_queue(spec).await.map_err(|err| {
                log::error!("topology: queue {} rejected: {err}", spec.name);
                RpcError::Topology(err)
            })?;
            self.mark_declared(entry);
        }

        for binding in plan.bindings() {
            let entry = Declared::Binding(binding.clone());
            if self.is_declared(&entry) {
                continue;
            }
            self.broker.bind_queue(binding).await.map_err(RpcError::Topology)?;
            self.mark_declared(entry);
        }

        log::debug!(
            "topology: ensured {} exchange(s), {} queue(s), {} binding(s)",
            plan.exchanges().len(),
            plan.queues().len(),
            plan.bindings().len()
        );
        Ok(())
    }

    fn is_declared(&self, entry: &Declared) -> bool {
        self.declared.lock().expect("declared topology mutex poisoned").contains(entry)
    }

    fn mark_declared(&self, entry: Declared) {
        self.declared.lock().expect("declared topology mutex poisoned").insert(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqrpc_broker::{BrokerError, MemoryBroker};

    #[test]
    fn resolve_is_deterministic_per_mode() {
        assert_eq!(
            resolve("billing", CallMode::Sync),
            Route {
                queue: "billing".into(),
                exchange: SYNC_EXCHANGE.into(),
                routing_key: "billing".into()
            }
        );
        let async_route = resolve("billing", CallMode::Async);
        assert_eq!(async_route.queue, "billing.async");
        assert_eq!(async_route.routing_key, async_route.queue);
        assert_eq!(async_route.exchange, ASYNC_EXCHANGE);

        let delayed = resolve("billing", CallMode::Delayed);
        assert_eq!(delayed.queue, "billing.delayed");
        assert_eq!(delayed.exchange, DELAYED_EXCHANGE);
        assert_eq!(resolve("billing", CallMode::Delayed), delayed);
    }

    #[test]
    fn only_sync_queues_carry_ttl() {
        let ttl = Some(Duration::from_secs(10));
        assert_eq!(request_queue_spec("billing", CallMode::Sync, ttl).message_ttl, ttl);
        assert_eq!(request_queue_spec("billing", CallMode::Async, ttl).message_ttl, None);
    }

    #[test]
    fn plan_deduplicates_shared_exchanges() {
        let mut plan = TopologyPlan::new();
        plan.request_route("a", CallMode::Sync, None).request_route("b", CallMode::Sync, None);
        assert_eq!(plan.exchanges().len(), 1);
        assert_eq!(plan.queues().len(), 2);
        assert_eq!(plan.bindings().len(), 2);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_fails_on_conflict() {
        let broker = MemoryBroker::new();
        let declarer = TopologyDeclarer::new(Arc::new(broker.clone()));

        let mut plan = TopologyPlan::new();
        plan.request_route("billing", CallMode::Sync, Some(Duration::from_secs(5)));
        declarer.ensure(&plan).await.expect("first ensure");
        declarer.ensure(&plan).await.expect("second ensure is a no-op");
        TopologyDeclarer::new(Arc::new(broker.clone()))
            .ensure(&plan)
            .await
            .expect("identical redeclaration from another process");
        assert!(broker.queue_exists("billing"));

        let mut conflicting = TopologyPlan::new();
        conflicting.request_route("billing", CallMode::Sync, Some(Duration::from_secs(60)));
        let err = declarer.ensure(&conflicting).await.expect_err("ttl conflict");
        assert!(matches!(err, RpcError::Topology(BrokerError::PreconditionFailed { .. })));
    }
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::BrokerError;
use crate::traits::{Broker, Consumer};
use crate::types::*;

/// The nameless exchange every queue is implicitly bound to by its own name.
pub const DEFAULT_EXCHANGE: &str = "";

/// An in-process broker implementing the full [`Broker`] contract.
///
/// Cloning is cheap and yields another handle to the same broker, the way a
/// connection pool hands out channels.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<BindingSpec>,
    published: HashMap<String, u64>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Queued>,
    consumers: usize,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct Queued {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
    enqueued_at: Instant,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for a consumer, or `None` if the queue does not exist.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|queue| queue.ready.len())
    }

    /// Messages handed to a consumer and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|queue| queue.unacked.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Total publishes accepted by `exchange`, routed or not.
    pub fn published_count(&self, exchange: &str) -> u64 {
        self.state().published.get(exchange).copied().unwrap_or(0)
    }

    /// Close the connection. Pending `next()` calls return `None` and every
    /// further operation fails with [`BrokerError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let state = self.state();
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("broker state mutex poisoned")
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

fn route(
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    properties: &MessageProperties,
    body: &[u8],
) -> usize {
    let mut targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        }
    } else {
        let fanout = state
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind == ExchangeKind::Fanout)
            .unwrap_or(false);
        state
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange && (fanout || binding.routing_key == routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect()
    };
    targets.sort();
    targets.dedup();

    let now = Instant::now();
    let mut routed = 0;
    for name in &targets {
        if let Some(queue) = state.queues.get_mut(name) {
            queue.ready.push_back(Queued {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
                redelivered: false,
                enqueued_at: now,
            });
            queue.notify.notify_one();
            routed += 1;
        }
    }

    if routed == 0 {
        log::debug!("memory-broker: unroutable message exchange={exchange} key={routing_key}");
    }
    routed
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => {
                Err(BrokerError::PreconditionFailed { kind: "exchange", name: spec.name.clone() })
            }
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(_) => {
                Err(BrokerError::PreconditionFailed { kind: "queue", name: spec.name.clone() })
            }
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: 0,
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::not_found("exchange", binding.exchange.as_str()));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::not_found("queue", binding.queue.as_str()));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.state();
        let queue = state.queues.remove(name).ok_or_else(|| BrokerError::not_found("queue", name))?;
        state.bindings.retain(|binding| binding.queue != name);
        queue.notify.notify_waiters();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let deferred = {
            let mut state = self.state();
            let kind = if exchange == DEFAULT_EXCHANGE {
                ExchangeKind::Direct
            } else {
                state
                    .exchanges
                    .get(exchange)
                    .map(|spec| spec.kind)
                    .ok_or_else(|| BrokerError::not_found("exchange", exchange))?
            };
            *state.published.entry(exchange.to_string()).or_default() += 1;

            match properties.delay {
                Some(delay) if kind == ExchangeKind::Delayed && !delay.is_zero() => Some(delay),
                _ => {
                    route(&mut state, exchange, routing_key, &properties, &body);
                    None
                }
            }
        };

        if let Some(delay) = deferred {
            let inner = Arc::clone(&self.inner);
            let exchange = exchange.to_string();
            let routing_key = routing_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let mut state = inner.state.lock().expect("broker state mutex poisoned");
                route(&mut state, &exchange, &routing_key, &properties, &body);
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        self.ensure_open()?;
        let notify = {
            let mut state = self.state();
            let entry =
                state.queues.get_mut(queue).ok_or_else(|| BrokerError::not_found("queue", queue))?;
            entry.consumers += 1;
            Arc::clone(&entry.notify)
        };
        log::trace!("memory-broker: consumer {consumer_tag} attached to {queue}");

        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            notify,
            in_flight: HashSet::new(),
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    tag: String,
    notify: Arc<Notify>,
    in_flight: HashSet<u64>,
}

impl MemoryConsumer {
    fn settle(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        if !self.in_flight.remove(&delivery_tag) {
            return Err(BrokerError::UnknownDeliveryTag { tag: delivery_tag });
        }
        let mut state = self.inner.state.lock().expect("broker state mutex poisoned");
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            if let Some(mut queued) = queue.unacked.remove(&delivery_tag) {
                if requeue {
                    queued.redelivered = true;
                    queue.ready.push_front(queued);
                    queue.notify.notify_one();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            {
                let mut state = self.inner.state.lock().expect("broker state mutex poisoned");
                let queue = state.queues.get_mut(&self.queue)?;
                while let Some(queued) = queue.ready.pop_front() {
                    if let Some(ttl) = queue.spec.message_ttl {
                        if queued.enqueued_at.elapsed() > ttl {
                            log::debug!(
                                "memory-broker: expired message dropped queue={}",
                                self.queue
                            );
                            continue;
                        }
                    }

                    let delivery_tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                    let delivery = Delivery {
                        delivery_tag,
                        redelivered: queued.redelivered,
                        exchange: queued.exchange.clone(),
                        routing_key: queued.routing_key.clone(),
                        properties: queued.properties.clone(),
                        body: queued.body.clone(),
                    };
                    queue.unacked.insert(delivery_tag, queued);
                    self.in_flight.insert(delivery_tag);
                    return Some(delivery);
                }
            }

            self.notify.notified().await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.settle(delivery_tag, false)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.settle(delivery_tag, requeue)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };

        for delivery_tag in self.in_flight.drain() {
            if let Some(mut queued) = queue.unacked.remove(&delivery_tag) {
                queued.redelivered = true;
                queue.ready.push_front(queued);
                queue.notify.notify_one();
            }
        }

        queue.consumers = queue.consumers.saturating_sub(1);
        if queue.spec.auto_delete && queue.consumers == 0 {
            log::debug!("memory-broker: auto-deleting queue {}", self.queue);
            state.queues.remove(&self.queue);
            state.bindings.retain(|binding| binding.queue != self.queue);
        }
    }
}

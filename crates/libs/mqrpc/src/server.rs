use std::sync::Arc;

use mqrpc_broker::{Broker, Consumer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RpcConfig;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::interceptor::{DuplicateInterceptor, NoDuplicates};
use crate::registry::MethodRegistry;
use crate::topology::{resolve, TopologyDeclarer, TopologyPlan};
use crate::types::{CallMode, RpcName};

const LOG_TARGET: &str = "mqrpc::server";

/// Consumes every request queue the registry has handlers for.
pub struct RpcServer {
    broker: Arc<dyn Broker>,
    registry: Arc<MethodRegistry>,
    interceptor: Arc<dyn DuplicateInterceptor>,
    config: RpcConfig,
}

impl RpcServer {
    pub fn new(broker: Arc<dyn Broker>, registry: MethodRegistry, config: RpcConfig) -> Self {
        Self {
            broker,
            registry: Arc::new(registry),
            interceptor: Arc::new(NoDuplicates),
            config,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn DuplicateInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Broker objects this server needs, with per-RPC TTLs applied.
    pub fn topology(&self) -> TopologyPlan {
        let mut plan = TopologyPlan::new();
        for (mode, rpc_name) in self.registry.routes() {
            plan.request_route(&rpc_name, mode, self.config.ttl_for(&rpc_name));
        }
        plan
    }

    /// Declare the topology and spawn the consumer tasks.
    ///
    /// Fails without consuming anything when the configuration is invalid or
    /// the broker rejects a declaration.
    pub async fn start(&self) -> Result<ServerHandle, RpcError> {
        self.config.validate()?;
        TopologyDeclarer::new(self.broker.clone()).ensure(&self.topology()).await?;

        let routes = self.registry.routes();
        let mut consumers: Vec<(Dispatcher, Box<dyn Consumer>)> = Vec::new();
        for (mode, rpc_name) in &routes {
            let queue = resolve(rpc_name, *mode).queue;
            let dispatcher = self.dispatcher(rpc_name, *mode);
            for index in 0..self.config.consumers_for(rpc_name) {
                let consumer = self.broker.consume(&queue, &format!("{queue}#{index}")).await?;
                consumers.push((dispatcher.clone(), consumer));
            }
        }

        let cancel = CancellationToken::new();
        let tasks = consumers
            .into_iter()
            .map(|(dispatcher, consumer)| {
                tokio::spawn(consume(dispatcher, consumer, cancel.clone()))
            })
            .collect::<Vec<_>>();

        log::info!(
            target: LOG_TARGET,
            "server: started {} consumer(s) on {} queue(s)",
            tasks.len(),
            routes.len()
        );
        Ok(ServerHandle { cancel, tasks })
    }

    fn dispatcher(&self, rpc_name: &RpcName, mode: CallMode) -> Dispatcher {
        Dispatcher::new(
            rpc_name.clone(),
            mode,
            self.registry.clone(),
            self.interceptor.clone(),
            self.broker.clone(),
            self.config.server.slow_call_threshold(),
        )
    }
}

/// Running consumer tasks of a started [`RpcServer`].
pub struct ServerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn consumer_count(&self) -> usize {
        self.tasks.len()
    }

    /// Token observed by every consumer task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop consuming. Messages already being processed are finished and
    /// acknowledged first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                log::warn!(target: LOG_TARGET, "server: consumer task ended abnormally: {err}");
            }
        }
        log::info!(target: LOG_TARGET, "server: stopped");
    }
}

async fn consume(
    dispatcher: Dispatcher,
    mut consumer: Box<dyn Consumer>,
    cancel: CancellationToken,
) {
    let tag = consumer.consumer_tag().to_string();
    log::debug!(
        target: LOG_TARGET,
        "consumer({tag}): started for {} {}",
        dispatcher.mode(),
        dispatcher.rpc_name()
    );
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else {
            log::warn!(target: LOG_TARGET, "consumer({tag}): queue closed");
            break;
        };
        let outcome = dispatcher.dispatch(&delivery).await;
        log::trace!(
            target: LOG_TARGET,
            "consumer({tag}): delivery {} -> {outcome:?}",
            delivery.delivery_tag
        );
        if let Err(err) = consumer.ack(delivery.delivery_tag).await {
            log::warn!(target: LOG_TARGET, "consumer({tag}): ack failed: {err}");
        }
    }
    log::debug!(target: LOG_TARGET, "consumer({tag}): stopped");
}

//! RPC over a message broker.
//!
//! Servers register handlers per `(mode, rpc name, command)` in a
//! [`MethodRegistry`], then [`RpcServer::start`] declares the topology and
//! consumes one request queue per RPC name and mode. Clients use a
//! [`SyncInvoker`] for request/reply calls with timeout and retry, or an
//! [`AsyncInvoker`] for fire-and-forget and delayed sends. [`rpc_client!`]
//! generates typed clients on top of both.
//!
//! Messages are JSON envelopes (`{"command", "data"}` requests and
//! `{"status", "message", "errorCode", "data"}` replies) carried by any
//! [`Broker`] implementation.

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod interceptor;
pub mod invoker;
pub mod registry;
pub mod server;
pub mod topology;
pub mod types;

pub use mqrpc_broker as broker;
pub use mqrpc_broker::{Broker, BrokerError, MemoryBroker};

pub use config::{ClientConfig, RpcConfig, RpcDefinition, ServerConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher, DropReason};
pub use error::{code, RpcError};
pub use interceptor::{CallContext, DuplicateInterceptor, NoDuplicates, SeenCache};
pub use invoker::{AsyncInvoker, SyncInvoker};
pub use registry::{HandlerBinding, MethodRegistry, ParamType, RegistryBuilder, RpcParam};
pub use server::{RpcServer, ServerHandle};
pub use topology::{Route, TopologyDeclarer, TopologyPlan};
pub use types::{CallMode, CorrelationId, ReplyStatus, RpcName, RpcResult};

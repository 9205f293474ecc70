//! Startup-built map from `(mode, rpc name, command)` to handler bindings.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::types::{CallMode, RpcName, RpcResult};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<RpcResult>> + Send>>;

/// Marker for typed request DTOs.
///
/// A typed parameter is deserialized from the envelope `data` object and its
/// constraints are checked before the handler runs. `Default` supplies the
/// instance used to pre-warm the type at registration.
pub trait RpcParam: Serialize + DeserializeOwned + Default + Send + 'static {
    /// One message per violated constraint; empty when valid.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Declared parameter form of a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    /// The raw envelope `data` object.
    Untyped,
    /// A validated [`RpcParam`], identified by type name.
    Typed(&'static str),
}

trait Invocable: Send + Sync {
    /// Materialize the parameter and start the call, or report violations.
    fn prepare(&self, data: Value) -> Result<HandlerFuture, Vec<String>>;
}

struct UntypedHandler<F> {
    handler: F,
}

impl<F, Fut> Invocable for UntypedHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<RpcResult>> + Send + 'static,
{
    fn prepare(&self, data: Value) -> Result<HandlerFuture, Vec<String>> {
        Ok(Box::pin((self.handler)(data)))
    }
}

struct TypedHandler<P, F> {
    handler: F,
    _param: PhantomData<fn() -> P>,
}

impl<P, F, Fut> Invocable for TypedHandler<P, F>
where
    P: RpcParam,
    F: Fn(P) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<RpcResult>> + Send + 'static,
{
    fn prepare(&self, data: Value) -> Result<HandlerFuture, Vec<String>> {
        let param: P = serde_json::from_value(data).map_err(|err| vec![err.to_string()])?;
        let violations = param.validate();
        if !violations.is_empty() {
            return Err(violations);
        }
        Ok(Box::pin((self.handler)(param)))
    }
}

/// Immutable registration of one command.
#[derive(Clone)]
pub struct HandlerBinding {
    invocable: Arc<dyn Invocable>,
    param_type: ParamType,
    allow_duplicate: bool,
}

impl HandlerBinding {
    pub fn param_type(&self) -> ParamType {
        self.param_type
    }

    /// Whether content-identical repeats may be invoked again.
    pub fn allow_duplicate(&self) -> bool {
        self.allow_duplicate
    }

    /// Materialize `data` into the declared parameter and return the pending
    /// invocation. `Err` carries the violation messages; the handler has not
    /// been called in that case.
    pub fn prepare(&self, data: Value) -> Result<HandlerFuture, Vec<String>> {
        self.invocable.prepare(data)
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("param_type", &self.param_type)
            .field("allow_duplicate", &self.allow_duplicate)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryKey {
    pub mode: CallMode,
    pub rpc_name: RpcName,
    pub command: String,
}

/// Collects registrations during startup. Every error is fatal.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    bindings: HashMap<RegistryKey, HandlerBinding>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking the raw `data` object.
    pub fn register<F, Fut>(
        &mut self,
        mode: CallMode,
        rpc_name: &str,
        command: &str,
        allow_duplicate: bool,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RpcResult>> + Send + 'static,
    {
        let binding = HandlerBinding {
            invocable: Arc::new(UntypedHandler { handler }),
            param_type: ParamType::Untyped,
            allow_duplicate,
        };
        self.insert(mode, rpc_name, command, binding)
    }

    /// Register a handler taking a validated DTO. The DTO type is pre-warmed
    /// here so a broken type refuses startup instead of failing its first call.
    pub fn register_typed<P, F, Fut>(
        &mut self,
        mode: CallMode,
        rpc_name: &str,
        command: &str,
        allow_duplicate: bool,
        handler: F,
    ) -> Result<&mut Self, RpcError>
    where
        P: RpcParam,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RpcResult>> + Send + 'static,
    {
        prewarm::<P>().map_err(|reason| RpcError::InvalidRegistration {
            rpc_name: rpc_name.to_string(),
            command: command.to_string(),
            reason,
        })?;
        let binding = HandlerBinding {
            invocable: Arc::new(TypedHandler { handler, _param: PhantomData }),
            param_type: ParamType::Typed(type_name::<P>()),
            allow_duplicate,
        };
        self.insert(mode, rpc_name, command, binding)
    }

    fn insert(
        &mut self,
        mode: CallMode,
        rpc_name: &str,
        command: &str,
        binding: HandlerBinding,
    ) -> Result<&mut Self, RpcError> {
        let invalid = |reason: &str| RpcError::InvalidRegistration {
            rpc_name: rpc_name.to_string(),
            command: command.to_string(),
            reason: reason.to_string(),
        };
        if rpc_name.trim().is_empty() {
            return Err(invalid("rpc name must not be blank"));
        }
        if command.trim().is_empty() {
            return Err(invalid("command must not be blank"));
        }

        let key =
            RegistryKey { mode, rpc_name: rpc_name.to_string(), command: command.to_string() };
        if self.bindings.contains_key(&key) {
            return Err(RpcError::DuplicateRegistration {
                mode,
                rpc_name: key.rpc_name,
                command: key.command,
            });
        }
        log::debug!(
            "registry: {mode} {rpc_name}/{command} -> {:?} allow_duplicate={}",
            binding.param_type,
            binding.allow_duplicate
        );
        self.bindings.insert(key, binding);
        Ok(self)
    }

    /// Freeze the registrations.
    pub fn build(self) -> MethodRegistry {
        let mut routes: HashMap<CallMode, HashMap<RpcName, HashMap<String, HandlerBinding>>> =
            HashMap::new();
        for (key, binding) in self.bindings {
            routes
                .entry(key.mode)
                .or_default()
                .entry(key.rpc_name)
                .or_default()
                .insert(key.command, binding);
        }
        MethodRegistry { routes }
    }
}

fn prewarm<P: RpcParam>() -> Result<(), String> {
    let sample = P::default();
    let value = serde_json::to_value(&sample)
        .map_err(|err| format!("default {} does not serialize: {err}", type_name::<P>()))?;
    if !value.is_object() {
        return Err(format!("{} must serialize to a JSON object", type_name::<P>()));
    }
    serde_json::from_value::<P>(value)
        .map_err(|err| format!("default {} does not deserialize: {err}", type_name::<P>()))?;
    let violations = catch_unwind(AssertUnwindSafe(|| sample.validate()))
        .map_err(|_| format!("constraint check of {} panicked", type_name::<P>()))?;
    log::trace!(
        "registry: pre-warmed {} ({} default violation(s))",
        type_name::<P>(),
        violations.len()
    );
    Ok(())
}

/// Read-only handler lookup shared by all consumer tasks.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    routes: HashMap<CallMode, HashMap<RpcName, HashMap<String, HandlerBinding>>>,
}

impl MethodRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, mode: CallMode, rpc_name: &str, command: &str) -> Option<&HandlerBinding> {
        self.routes.get(&mode)?.get(rpc_name)?.get(command)
    }

    /// Every `(mode, rpc name)` with at least one command, sorted.
    pub fn routes(&self) -> Vec<(CallMode, RpcName)> {
        let mut routes: Vec<(CallMode, RpcName)> = self
            .routes
            .iter()
            .flat_map(|(mode, names)| names.keys().map(move |name| (*mode, name.clone())))
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.values().flat_map(HashMap::values).map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

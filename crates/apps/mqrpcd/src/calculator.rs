//! Demo `calculator` service: SYNC `add` and `divide`, ASYNC `record`.

use std::sync::{Arc, Mutex};

use mqrpc::{code, CallMode, RegistryBuilder, RpcError, RpcParam, RpcResult};
use serde::{Deserialize, Serialize};

pub const RPC_NAME: &str = "calculator";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

impl RpcParam for AddRequest {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DivideRequest {
    pub dividend: f64,
    pub divisor: f64,
}

impl RpcParam for DivideRequest {
    fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if !self.dividend.is_finite() {
            violations.push("dividend must be finite".to_string());
        }
        if self.divisor == 0.0 {
            violations.push("divisor must not be zero".to_string());
        }
        violations
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sum {
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quotient {
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub operation: String,
    #[serde(default)]
    pub detail: String,
}

impl RpcParam for AuditEntry {
    fn validate(&self) -> Vec<String> {
        if self.operation.trim().is_empty() {
            vec!["operation must not be blank".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Entries received through ASYNC `record` calls.
#[derive(Clone, Debug, Default)]
pub struct AuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl AuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit log mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: AuditEntry) {
        self.entries.lock().expect("audit log mutex poisoned").push(entry);
    }
}

async fn add(request: AddRequest) -> anyhow::Result<RpcResult> {
    match request.a.checked_add(request.b) {
        Some(value) => Ok(RpcResult::success_with(&Sum { value })?),
        None => Ok(RpcResult::failure(
            code::VALIDATION,
            format!("{} + {} overflows", request.a, request.b),
        )),
    }
}

async fn divide(request: DivideRequest) -> anyhow::Result<RpcResult> {
    let value = request.dividend / request.divisor;
    if !value.is_finite() {
        return Ok(RpcResult::failure(code::VALIDATION, "quotient is not finite"));
    }
    Ok(RpcResult::success_with(&Quotient { value })?)
}

async fn record(audit: AuditLog, entry: AuditEntry) -> anyhow::Result<RpcResult> {
    log::info!("calculator: audit {} {}", entry.operation, entry.detail);
    audit.push(entry);
    Ok(RpcResult::success(serde_json::Value::Null))
}

/// Register every calculator command on `builder`. `record` is served in
/// both fire-and-forget modes.
pub fn register(builder: &mut RegistryBuilder, audit: AuditLog) -> Result<(), RpcError> {
    builder
        .register_typed(CallMode::Sync, RPC_NAME, "add", true, add)?
        .register_typed(CallMode::Sync, RPC_NAME, "divide", true, divide)?;
    for mode in [CallMode::Async, CallMode::Delayed] {
        let audit = audit.clone();
        builder.register_typed(mode, RPC_NAME, "record", true, move |entry: AuditEntry| {
            record(audit.clone(), entry)
        })?;
    }
    Ok(())
}

mqrpc::rpc_client! {
    /// Typed SYNC client for the calculator service.
    pub struct CalculatorClient: sync for "calculator" {
        fn add(AddRequest) -> Sum = "add";
        fn divide(DivideRequest) -> Quotient = "divide";
    }
}

mqrpc::rpc_client! {
    /// Fire-and-forget audit trail of the calculator service.
    pub struct AuditClient: async for "calculator" {
        fn record(AuditEntry) = "record";
    }
}

mqrpc::rpc_client! {
    pub struct DelayedAuditClient: delayed for "calculator" {
        fn record_later(AuditEntry) = "record";
    }
}

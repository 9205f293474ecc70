use std::sync::Arc;
use std::time::Duration;

use mqrpc::{Broker, MemoryBroker, MethodRegistry, RpcConfig, RpcError, RpcServer};

use crate::calculator::{
    self, AddRequest, AuditClient, AuditEntry, AuditLog, CalculatorClient, DelayedAuditClient,
    DivideRequest,
};

const AUDIT_WAIT: Duration = Duration::from_secs(5);

/// What one run of the demo observed.
#[derive(Clone, Debug, PartialEq)]
pub struct DemoReport {
    pub sum: i64,
    pub quotient: f64,
    /// Server message for the rejected division by zero.
    pub rejected_division: Option<String>,
    pub audited: Vec<AuditEntry>,
}

/// Serve the calculator on an in-process broker, call it through the typed
/// clients and shut the server down again.
pub async fn run_demo(config: RpcConfig) -> anyhow::Result<DemoReport> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let audit = AuditLog::default();

    let mut builder = MethodRegistry::builder();
    calculator::register(&mut builder, audit.clone())?;
    let server = RpcServer::new(broker.clone(), builder.build(), config.clone());
    let handle = server.start().await?;
    log::info!(
        "mqrpcd: serving {} with {} consumer(s)",
        calculator::RPC_NAME,
        handle.consumer_count()
    );

    let client = CalculatorClient::connect(broker.clone(), config.client.clone()).await?;
    let audit_client = AuditClient::connect(broker.clone(), config.client.clone()).await?;
    let delayed_client = DelayedAuditClient::connect(broker.clone(), config.client.clone()).await?;

    let sum = client.add(&AddRequest { a: 2, b: 40 }).await?.value;
    let quotient = client.divide(&DivideRequest { dividend: 1.0, divisor: 4.0 }).await?.value;
    let rejected_division =
        match client.divide(&DivideRequest { dividend: 1.0, divisor: 0.0 }).await {
            Err(RpcError::Remote { message, .. }) => Some(message),
            Err(err) => return Err(err.into()),
            Ok(quotient) => {
                log::warn!("mqrpcd: division by zero returned {}", quotient.value);
                None
            }
        };

    audit_client
        .record(&AuditEntry { operation: "add".into(), detail: format!("2 + 40 = {sum}") })
        .await?;
    delayed_client
        .record_later(
            &AuditEntry { operation: "divide".into(), detail: format!("1 / 4 = {quotient}") },
            Duration::from_millis(50),
        )
        .await?;

    tokio::time::timeout(AUDIT_WAIT, async {
        while audit.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("audit entries did not arrive within {AUDIT_WAIT:?}"))?;

    drop(client);
    handle.shutdown().await;

    Ok(DemoReport { sum, quotient, rejected_division, audited: audit.entries() })
}

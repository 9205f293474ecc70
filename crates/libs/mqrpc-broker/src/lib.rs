//! Message broker contract consumed by the mqrpc protocol layer.
//!
//! The RPC core never talks to a concrete broker client. It relies on the
//! small contract defined here:
//!
//! - **Topology**: idempotent declaration of exchanges, queues and bindings
//! - **Publishing**: routed by exchange + routing key, with message properties
//!   (correlation id, reply-to, content type/encoding, per-message delay)
//! - **Consuming**: isolated per-consumer channels with manual acknowledgment
//!
//! [`MemoryBroker`] implements the contract in-process. It is what the test
//! suites and the demo daemon run against.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use traits::{Broker, Consumer};
pub use types::*;

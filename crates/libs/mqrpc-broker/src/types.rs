use std::time::Duration;

// ── Topology ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    Direct,
    /// Routes to every bound queue, ignoring the routing key.
    Fanout,
    /// Direct routing, deferred by the per-message `delay` property.
    Delayed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn direct(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Direct, durable: true, auto_delete: false }
    }

    pub fn delayed(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Delayed, durable: true, auto_delete: false }
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Fanout, durable: true, auto_delete: false }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Messages waiting longer than this are discarded instead of delivered.
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// A durable, shared request queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
        }
    }

    /// A private queue that lives as long as its consumer.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            message_ttl: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self { queue: queue.into(), exchange: exchange.into(), routing_key: routing_key.into() }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Transport metadata carried next to the message body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    /// Routing key of the queue replies should be published to.
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Honoured by [`ExchangeKind::Delayed`] exchanges only.
    pub delay: Option<Duration>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A message handed to a consumer. It stays unacknowledged until the consumer
/// settles `delivery_tag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

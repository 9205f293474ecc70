use std::time::{Duration, Instant};

use mqrpc_broker::{
    BindingSpec, Broker, BrokerError, ExchangeSpec, MemoryBroker, MessageProperties, QueueSpec,
};
use tokio::time::timeout;

async fn bound_queue(broker: &MemoryBroker, exchange: ExchangeSpec, queue: QueueSpec) {
    broker.declare_exchange(&exchange).await.expect("declare exchange");
    broker.declare_queue(&queue).await.expect("declare queue");
    broker
        .bind_queue(&BindingSpec::new(&queue.name, &exchange.name, &queue.name))
        .await
        .expect("bind queue");
}

#[tokio::test]
async fn redeclaring_identical_objects_is_idempotent() {
    let broker = MemoryBroker::new();
    let exchange = ExchangeSpec::direct("orders.sync");
    let queue = QueueSpec::durable("orders");

    for _ in 0..3 {
        broker.declare_exchange(&exchange).await.expect("identical exchange");
        broker.declare_queue(&queue).await.expect("identical queue");
    }
    assert!(broker.queue_exists("orders"));
}

#[tokio::test]
async fn conflicting_redeclaration_fails_with_precondition() {
    let broker = MemoryBroker::new();
    broker.declare_exchange(&ExchangeSpec::direct("orders.sync")).await.expect("first declare");
    let err = broker
        .declare_exchange(&ExchangeSpec::direct("orders.sync").with_durable(false))
        .await
        .expect_err("durability conflict must fail");
    assert_eq!(
        err,
        BrokerError::PreconditionFailed { kind: "exchange", name: "orders.sync".into() }
    );

    broker.declare_queue(&QueueSpec::durable("orders")).await.expect("first queue");
    let err = broker
        .declare_queue(
            &QueueSpec::durable("orders").with_message_ttl(Some(Duration::from_secs(5))),
        )
        .await
        .expect_err("ttl conflict must fail");
    assert!(matches!(err, BrokerError::PreconditionFailed { kind: "queue", .. }));
}

#[tokio::test]
async fn publish_to_unknown_exchange_is_not_found() {
    let broker = MemoryBroker::new();
    let err = broker
        .publish("missing", "key", MessageProperties::default(), b"{}".to_vec())
        .await
        .expect_err("unknown exchange");
    assert!(matches!(err, BrokerError::NotFound { kind: "exchange", .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn direct_exchange_routes_by_key_and_preserves_properties() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::direct("svc.sync"), QueueSpec::durable("svc")).await;

    broker
        .publish("svc.sync", "other", MessageProperties::default(), b"dropped".to_vec())
        .await
        .expect("unroutable publish still succeeds");
    assert_eq!(broker.ready_count("svc"), Some(0));

    let properties = MessageProperties::default()
        .with_correlation_id("c-1")
        .with_reply_to("svc.reply.abc")
        .with_content_type("application/json");
    broker
        .publish("svc.sync", "svc", properties.clone(), b"hello".to_vec())
        .await
        .expect("publish");
    assert_eq!(broker.published_count("svc.sync"), 2);

    let mut consumer = broker.consume("svc", "c1").await.expect("consume");
    let delivery = timeout(Duration::from_secs(1), consumer.next())
        .await
        .expect("delivery in time")
        .expect("delivery");
    assert_eq!(delivery.body, b"hello".to_vec());
    assert_eq!(delivery.properties, properties);
    assert!(!delivery.redelivered);
    assert_eq!(broker.unacked_count("svc"), Some(1));

    consumer.ack(delivery.delivery_tag).await.expect("ack");
    assert_eq!(broker.unacked_count("svc"), Some(0));
    let err = consumer.ack(delivery.delivery_tag).await.expect_err("double ack");
    assert_eq!(err, BrokerError::UnknownDeliveryTag { tag: delivery.delivery_tag });
}

#[tokio::test]
async fn dropped_consumer_requeues_unacked_delivery_as_redelivered() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::direct("svc.async"), QueueSpec::durable("svc.async"))
        .await;
    broker
        .publish("svc.async", "svc.async", MessageProperties::default(), b"job".to_vec())
        .await
        .expect("publish");

    let mut first = broker.consume("svc.async", "first").await.expect("consume");
    let delivery = first.next().await.expect("delivery");
    assert!(!delivery.redelivered);
    drop(first);

    assert_eq!(broker.ready_count("svc.async"), Some(1));
    let mut second = broker.consume("svc.async", "second").await.expect("consume");
    let again = second.next().await.expect("redelivery");
    assert!(again.redelivered);
    assert_eq!(again.body, b"job".to_vec());
}

#[tokio::test]
async fn nack_with_requeue_puts_message_back_at_head() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::direct("svc.sync"), QueueSpec::durable("svc")).await;
    for body in [b"one".to_vec(), b"two".to_vec()] {
        broker
            .publish("svc.sync", "svc", MessageProperties::default(), body)
            .await
            .expect("publish");
    }

    let mut consumer = broker.consume("svc", "c").await.expect("consume");
    let first = consumer.next().await.expect("first");
    consumer.nack(first.delivery_tag, true).await.expect("nack");
    let again = consumer.next().await.expect("again");
    assert_eq!(again.body, b"one".to_vec());
    assert!(again.redelivered);
}

#[tokio::test]
async fn auto_delete_queue_disappears_with_last_consumer() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::direct("svc.reply"), QueueSpec::transient("svc.reply.x"))
        .await;

    let consumer = broker.consume("svc.reply.x", "reply").await.expect("consume");
    assert!(broker.queue_exists("svc.reply.x"));
    drop(consumer);
    assert!(!broker.queue_exists("svc.reply.x"));

    broker
        .publish("svc.reply", "svc.reply.x", MessageProperties::default(), b"late".to_vec())
        .await
        .expect("publishing to a vanished binding is not an error");
}

#[tokio::test]
async fn delayed_exchange_defers_routing() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::delayed("svc.delayed"), QueueSpec::durable("svc.delayed"))
        .await;

    let started = Instant::now();
    broker
        .publish(
            "svc.delayed",
            "svc.delayed",
            MessageProperties::default().with_delay(Duration::from_millis(120)),
            b"later".to_vec(),
        )
        .await
        .expect("publish");
    assert_eq!(broker.ready_count("svc.delayed"), Some(0));

    let mut consumer = broker.consume("svc.delayed", "c").await.expect("consume");
    let delivery = timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("delayed delivery arrives")
        .expect("delivery");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(delivery.body, b"later".to_vec());
}

#[tokio::test]
async fn expired_messages_are_not_delivered() {
    let broker = MemoryBroker::new();
    bound_queue(
        &broker,
        ExchangeSpec::direct("svc.sync"),
        QueueSpec::durable("svc").with_message_ttl(Some(Duration::from_millis(30))),
    )
    .await;
    broker
        .publish("svc.sync", "svc", MessageProperties::default(), b"stale".to_vec())
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let mut consumer = broker.consume("svc", "c").await.expect("consume");
    assert!(
        timeout(Duration::from_millis(100), consumer.next()).await.is_err(),
        "expired message must not be delivered"
    );
}

#[tokio::test]
async fn close_wakes_consumers_and_rejects_operations() {
    let broker = MemoryBroker::new();
    bound_queue(&broker, ExchangeSpec::direct("svc.sync"), QueueSpec::durable("svc")).await;
    let mut consumer = broker.consume("svc", "c").await.expect("consume");

    let waiter = tokio::spawn(async move { consumer.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.close();

    let next = timeout(Duration::from_secs(1), waiter)
        .await
        .expect("consumer wakes on close")
        .expect("join consumer");
    assert!(next.is_none());

    let err = broker
        .publish("svc.sync", "svc", MessageProperties::default(), Vec::new())
        .await
        .expect_err("closed broker");
    assert_eq!(err, BrokerError::Closed);
    assert!(err.is_retryable());
}

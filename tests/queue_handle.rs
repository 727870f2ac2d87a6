// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_queue::{
    memory::MemoryBroker, AmqpError, Content, ContentType, Envelope, MessageProperties, PublishOptions,
    QueueDefinition, QueueHandle, QueueMetadata, QueueOptions, SubscribeOptions,
};
use opentelemetry::{trace::TraceContextExt, Context};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

async fn handle(broker: &MemoryBroker, options: QueueOptions) -> QueueHandle {
    QueueHandle::with_options(broker.provider(), None, Some(&options))
        .await
        .unwrap()
}

/// Subscribes and forwards every message to the returned receiver.
async fn collect(
    queue: &QueueHandle,
    options: SubscribeOptions,
) -> mpsc::UnboundedReceiver<Result<Envelope, AmqpError>> {
    let (tx, rx) = mpsc::unbounded_channel();
    queue
        .subscribe(
            move |message: Result<Envelope, AmqpError>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                }
            },
            options,
        )
        .await
        .unwrap();
    rx
}

async fn echo(queue: &QueueHandle) {
    queue
        .subscribe(
            |message: Result<Envelope, AmqpError>| async move {
                let envelope = message.unwrap();
                envelope
                    .reply(envelope.content.clone(), PublishOptions::default())
                    .await
                    .unwrap();
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn json_job_is_answered_through_envelope_reply() {
    let broker = MemoryBroker::new();
    let jobs = handle(&broker, QueueOptions::new().name("jobs").rpc(true).json()).await;
    let mut received = collect(&jobs, SubscribeOptions::default()).await;

    let sent = jobs
        .publish(json!({"task": "x"}), PublishOptions::default())
        .await
        .unwrap();

    let envelope = received.recv().await.unwrap().unwrap();
    assert_eq!(envelope.content, Content::Json(json!({"task": "x"})));
    assert_eq!(envelope.correlation_id(), sent.correlation_id());

    envelope
        .reply(json!({"status": "ok"}), PublishOptions::default())
        .await
        .unwrap();

    let reply = jobs.reply_of(&sent).await.unwrap();
    assert_eq!(reply.content, Content::Json(json!({"status": "ok"})));
    assert_eq!(reply.correlation_id(), sent.correlation_id());
    assert_eq!(jobs.pending_replies(), 0);
}

#[tokio::test]
async fn raw_request_round_trips_through_a_separate_worker() {
    let broker = MemoryBroker::new();
    let caller = handle(&broker, QueueOptions::new().name("raw").rpc(true)).await;
    let worker = handle(&broker, QueueOptions::new().name("raw")).await;
    echo(&worker).await;

    let reply = caller
        .request(&[1u8, 2, 3][..], PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.content, Content::Raw(vec![1, 2, 3]));
}

#[tokio::test]
async fn concurrent_calls_receive_their_own_replies() {
    let broker = MemoryBroker::new();
    let caller = handle(&broker, QueueOptions::new().name("calc").rpc(true).json()).await;
    let worker = handle(&broker, QueueOptions::new().name("calc").json()).await;
    let mut received = collect(&worker, SubscribeOptions::default()).await;

    let first = caller.publish(json!({"n": 1}), PublishOptions::default()).await.unwrap();
    let second = caller.publish(json!({"n": 2}), PublishOptions::default()).await.unwrap();
    assert_ne!(first.correlation_id(), second.correlation_id());

    let a = received.recv().await.unwrap().unwrap();
    let b = received.recv().await.unwrap().unwrap();

    // Answer in reverse order.
    b.reply(b.content.clone(), PublishOptions::default()).await.unwrap();
    a.reply(a.content.clone(), PublishOptions::default()).await.unwrap();

    let (first_reply, second_reply) = tokio::join!(caller.reply_of(&first), caller.reply_of(&second));

    assert_eq!(first_reply.unwrap().content, Content::Json(json!({"n": 1})));
    assert_eq!(second_reply.unwrap().content, Content::Json(json!({"n": 2})));
    assert_eq!(caller.pending_replies(), 0);
}

#[tokio::test]
async fn unanswered_call_times_out_and_late_reply_is_dropped() {
    let broker = MemoryBroker::new();
    let caller = handle(
        &broker,
        QueueOptions::new()
            .name("slow")
            .rpc(true)
            .reply_timeout(Duration::from_millis(100)),
    )
    .await;

    let sent = caller.publish("ping", PublishOptions::default()).await.unwrap();
    let id = sent.correlation_id().unwrap().to_owned();

    assert_eq!(
        caller.reply_of(&sent).await.unwrap_err(),
        AmqpError::ReplyTimeout(id.clone())
    );
    assert_eq!(caller.pending_replies(), 0);

    caller
        .reply(
            "pong",
            PublishOptions::new()
                .reply_to(caller.reply_queue().unwrap())
                .correlation_id(&id),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(caller.pending_replies(), 0);
    assert_eq!(broker.message_count(caller.reply_queue().unwrap()), Some(0));
}

#[tokio::test]
async fn full_registry_does_not_block_publishing() {
    let broker = MemoryBroker::new();
    let caller = handle(
        &broker,
        QueueOptions::new().name("busy").rpc(true).max_pending_replies(2),
    )
    .await;

    let mut sent = vec![];
    for _ in 0..3 {
        sent.push(caller.publish("ping", PublishOptions::default()).await.unwrap());
    }

    assert_eq!(broker.message_count("busy"), Some(3));
    assert_eq!(caller.pending_replies(), 2);
    assert!(sent[2].correlation_id().is_some());
    assert_eq!(
        caller.reply_of(&sent[2]).await.unwrap_err(),
        AmqpError::RegistryFull(2)
    );
}

#[tokio::test]
async fn abandoned_wait_releases_its_slot() {
    let broker = MemoryBroker::new();
    let caller = handle(&broker, QueueOptions::new().name("idle").rpc(true)).await;

    let sent = caller.publish("ping", PublishOptions::default()).await.unwrap();
    assert_eq!(caller.pending_replies(), 1);

    let waited = tokio::time::timeout(Duration::from_millis(20), caller.reply_of(&sent)).await;
    assert!(waited.is_err());
    assert_eq!(caller.pending_replies(), 0);
}

#[tokio::test]
async fn malformed_json_fails_subscribe_but_not_reply_of() {
    let broker = MemoryBroker::new();
    let caller = handle(&broker, QueueOptions::new().name("mixed").rpc(true).json()).await;
    let worker = handle(&broker, QueueOptions::new().name("mixed")).await;
    let mut received = collect(&worker, SubscribeOptions::default()).await;

    let sent = caller.publish(json!({"q": 1}), PublishOptions::default()).await.unwrap();
    let request = received.recv().await.unwrap().unwrap();
    request.reply("{not json", PublishOptions::default()).await.unwrap();

    let reply = caller.reply_of(&sent).await.unwrap();
    assert_eq!(reply.content, Content::Raw(b"{not json".to_vec()));

    let json_worker = handle(&broker, QueueOptions::new().name("strict").json()).await;
    let mut strict = collect(&json_worker, SubscribeOptions::default()).await;
    json_worker
        .publish("{oops", PublishOptions::new().content_type(ContentType::Raw))
        .await
        .unwrap();

    assert!(matches!(
        strict.recv().await.unwrap(),
        Err(AmqpError::ParsePayloadError(_))
    ));
}

#[tokio::test]
async fn text_published_on_a_json_queue_arrives_as_a_json_string() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("greetings").json()).await;
    let mut received = collect(&queue, SubscribeOptions::default()).await;

    queue.publish("hello", PublishOptions::default()).await.unwrap();

    let envelope = received.recv().await.unwrap().unwrap();
    assert_eq!(envelope.content, Content::Json(json!("hello")));
}

#[tokio::test]
async fn invalid_raw_bytes_are_rejected_on_a_json_queue() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("typed").json()).await;

    let result = queue.publish(&b"{oops"[..], PublishOptions::default()).await;

    assert!(matches!(result, Err(AmqpError::SerializePayloadError(_))));
    assert_eq!(broker.message_count("typed"), Some(0));
}

#[tokio::test]
async fn undecodable_delivery_does_not_stay_unacked() {
    let broker = MemoryBroker::new();
    let queue = handle(
        &broker,
        QueueOptions::new().name("strict-work").json().no_ack(false).prefetch(1),
    )
    .await;
    let mut received = collect(&queue, SubscribeOptions::default()).await;

    queue
        .publish("{bad", PublishOptions::new().content_type(ContentType::Raw))
        .await
        .unwrap();
    queue.publish(json!({"ok": true}), PublishOptions::default()).await.unwrap();

    assert!(matches!(
        received.recv().await.unwrap(),
        Err(AmqpError::ParsePayloadError(_))
    ));

    let envelope = received.recv().await.unwrap().unwrap();
    assert_eq!(envelope.content, Content::Json(json!({"ok": true})));
    assert_eq!(broker.unacked_count(), 1);

    envelope.ack().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn handler_runs_inside_the_consumer_span() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("traced")).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    queue
        .subscribe(
            move |_message: Result<Envelope, AmqpError>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Context::current().has_active_span());
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    queue.publish("event", PublishOptions::default()).await.unwrap();

    assert!(rx.recv().await.unwrap());
}

#[tokio::test]
async fn subscribe_can_override_content_type() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("events").json()).await;
    let mut received = collect(
        &queue,
        SubscribeOptions::new().content_type(ContentType::Raw),
    )
    .await;

    queue.publish(json!([1, 2]), PublishOptions::default()).await.unwrap();

    let envelope = received.recv().await.unwrap().unwrap();
    assert_eq!(envelope.content, Content::Raw(b"[1,2]".to_vec()));
}

#[tokio::test]
async fn purge_removes_waiting_messages() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("backlog")).await;
    for i in 0..5 {
        queue.publish(format!("m{i}").as_str(), PublishOptions::default()).await.unwrap();
    }

    assert_eq!(queue.purge().await.unwrap(), 5);
    assert_eq!(queue.purge().await.unwrap(), 0);
}

#[tokio::test]
async fn manual_ack_settles_delivery() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("work").no_ack(false).prefetch(4)).await;
    let mut received = collect(&queue, SubscribeOptions::default()).await;

    queue.publish("job", PublishOptions::default()).await.unwrap();
    let envelope = received.recv().await.unwrap().unwrap();
    assert_eq!(broker.unacked_count(), 1);
    assert_eq!(broker.prefetch_count(), Some(4));

    envelope.ack().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn auto_ack_envelope_ack_is_a_no_op() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("fire")).await;
    let mut received = collect(&queue, SubscribeOptions::default()).await;

    queue.publish("event", PublishOptions::default()).await.unwrap();
    let envelope = received.recv().await.unwrap().unwrap();

    envelope.ack().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn reply_to_a_message_without_reply_to_fails() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("plain")).await;
    let mut received = collect(&queue, SubscribeOptions::default()).await;

    queue.publish("event", PublishOptions::default()).await.unwrap();
    let envelope = received.recv().await.unwrap().unwrap();

    assert_eq!(
        envelope.reply("answer", PublishOptions::default()).await.unwrap_err(),
        AmqpError::MissingReplyTo
    );
}

#[tokio::test]
async fn reply_of_needs_a_correlation_id() {
    let broker = MemoryBroker::new();
    let queue = handle(&broker, QueueOptions::new().name("ids").rpc(true)).await;
    let published = queue.publish("x", PublishOptions::default()).await.unwrap();
    let mut stripped = published.clone();
    stripped.properties = MessageProperties::default();

    assert_eq!(
        queue.reply_of(&stripped).await.unwrap_err(),
        AmqpError::MissingCorrelationId
    );
}

struct Orders;

impl QueueMetadata for Orders {
    fn queue_options() -> QueueOptions {
        QueueOptions::new().name("orders").durable(true).json()
    }
}

#[tokio::test]
async fn declarative_options_merge_with_runtime_options() {
    let broker = MemoryBroker::new();
    let orders = QueueHandle::for_metadata::<Orders>(
        broker.provider(),
        Some(&QueueOptions::new().rpc(true)),
    )
    .await
    .unwrap();

    let definition = orders.definition();
    assert_eq!(definition.name(), "orders");
    assert!(definition.durable());
    assert!(definition.rpc());
    assert_eq!(definition.content_type(), ContentType::Json);
    assert!(orders.reply_queue().unwrap().starts_with("amq.gen-"));
}

#[tokio::test]
async fn incompatible_redeclaration_fails_construction() {
    let broker = MemoryBroker::new();
    handle(&broker, QueueOptions::new().name("shared")).await;

    let result = QueueHandle::new(
        broker.provider(),
        QueueDefinition::build(None, Some(&QueueOptions::new().name("shared").durable(true))),
    )
    .await;

    assert_eq!(
        result.unwrap_err(),
        AmqpError::DeclareQueueError("shared".to_owned())
    );
}

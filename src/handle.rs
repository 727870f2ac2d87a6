// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Handle
//!
//! A [`QueueHandle`] owns one declared queue and offers every messaging
//! pattern on it: fire-and-forget publish, subscribe, acknowledgement, purge
//! and request/reply.
//!
//! Request/reply works over plain queues. A handle whose definition has `rpc`
//! set declares a private, server-named reply queue at construction and keeps
//! a listener on it. Each publish on such a handle carries a fresh correlation
//! id and the reply queue as `reply_to`; the consumer answers through
//! [`Envelope::reply`], and the caller picks the answer up with
//! [`QueueHandle::reply_of`].
//!
//! All operations go through the channel returned by the handle's
//! [`ChannelProvider`]. Ordering of concurrent sends is left to the transport.

use crate::{
    errors::AmqpError,
    listener::ReplyListener,
    message::{
        Content, ContentType, Envelope, MessageProperties, PublishOptions, SubscribeOptions,
    },
    otel,
    provider::{AmqpChannel, ChannelProvider, ConsumeOptions, DeclaredQueue, Delivery},
    queue::{QueueDefinition, QueueMetadata, QueueOptions},
    registry::CorrelationRegistry,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{FutureExt, Span, Status, TraceContextExt},
};
use std::{borrow::Cow, fmt, future::Future, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Receives the messages of a subscription.
///
/// A delivery whose body cannot be decoded for the subscription's content
/// type arrives as `Err(AmqpError::ParsePayloadError)`, and failures of the
/// delivery stream itself arrive as errors too.
///
/// Any async closure taking `Result<Envelope, AmqpError>` implements this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn exec(&self, message: Result<Envelope, AmqpError>);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Result<Envelope, AmqpError>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn exec(&self, message: Result<Envelope, AmqpError>) {
        (self)(message).await
    }
}

/// What `reply_of` should wait for: a correlation id or a published envelope.
#[derive(Debug, Clone, Copy)]
pub enum ReplyTarget<'a> {
    Id(&'a str),
    Message(&'a Envelope),
}

impl<'a> From<&'a str> for ReplyTarget<'a> {
    fn from(value: &'a str) -> Self {
        ReplyTarget::Id(value)
    }
}

impl<'a> From<&'a String> for ReplyTarget<'a> {
    fn from(value: &'a String) -> Self {
        ReplyTarget::Id(value)
    }
}

impl<'a> From<&'a Envelope> for ReplyTarget<'a> {
    fn from(value: &'a Envelope) -> Self {
        ReplyTarget::Message(value)
    }
}

/// A running consumer started by [`QueueHandle::subscribe`].
///
/// Dropping the subscription leaves the consumer running; call
/// [`Subscription::cancel`] to stop it.
pub struct Subscription {
    queue: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once the delivery stream ended or the consumer was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        debug!(queue = self.queue, "cancelling consumer");
        self.task.abort();
    }
}

struct Rpc {
    registry: Arc<CorrelationRegistry>,
    listener: ReplyListener,
}

struct Inner {
    provider: Arc<dyn ChannelProvider>,
    definition: QueueDefinition,
    queue: DeclaredQueue,
    rpc: Option<Rpc>,
}

/// Handle to one declared queue. Cheap to clone; clones share the queue,
/// the reply queue and the correlation registry.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<Inner>,
}

impl QueueHandle {
    /// Declares the queue and, for rpc definitions, the reply queue and its listener.
    ///
    /// # Parameters
    /// * `provider` - Source of the channel used by every operation of the handle
    /// * `definition` - Merged queue definition
    ///
    /// # Returns
    /// A ready handle. Any channel or declaration failure fails the
    /// construction and no handle is produced.
    pub async fn new(
        provider: Arc<dyn ChannelProvider>,
        definition: QueueDefinition,
    ) -> Result<QueueHandle, AmqpError> {
        let channel = provider.channel().await?;

        let queue = match channel
            .assert_queue(&definition.name, &definition.declare_options())
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = definition.name,
                    "failure to declare queue"
                );
                return Err(err);
            }
        };
        debug!(queue = queue.name, "queue declared");

        let rpc = if definition.rpc {
            let registry = CorrelationRegistry::new(
                definition.reply_timeout(),
                definition.max_pending_replies,
            );
            let listener = ReplyListener::start(channel.as_ref(), registry.clone()).await?;
            Some(Rpc { registry, listener })
        } else {
            None
        };

        Ok(QueueHandle {
            inner: Arc::new(Inner {
                provider,
                definition,
                queue,
                rpc,
            }),
        })
    }

    /// Builds the definition from a declarative and a runtime layer, then creates the handle.
    pub async fn with_options(
        provider: Arc<dyn ChannelProvider>,
        declared: Option<&QueueOptions>,
        runtime: Option<&QueueOptions>,
    ) -> Result<QueueHandle, AmqpError> {
        QueueHandle::new(provider, QueueDefinition::build(declared, runtime)).await
    }

    /// Creates the handle for a queue type carrying its own declarative options.
    pub async fn for_metadata<M: QueueMetadata>(
        provider: Arc<dyn ChannelProvider>,
        runtime: Option<&QueueOptions>,
    ) -> Result<QueueHandle, AmqpError> {
        let declared = M::queue_options();
        QueueHandle::with_options(provider, Some(&declared), runtime).await
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.inner.definition
    }

    /// The queue as declared on the broker.
    pub fn queue(&self) -> &DeclaredQueue {
        &self.inner.queue
    }

    pub fn name(&self) -> &str {
        &self.inner.queue.name
    }

    /// Name of the private reply queue, for rpc handles.
    pub fn reply_queue(&self) -> Option<&str> {
        self.inner.rpc.as_ref().map(|rpc| rpc.listener.queue_name())
    }

    /// Number of reply slots currently held in the correlation registry.
    pub fn pending_replies(&self) -> usize {
        self.inner
            .rpc
            .as_ref()
            .map(|rpc| rpc.registry.len())
            .unwrap_or_default()
    }

    /// Sends a message to the queue.
    ///
    /// On rpc handles the message gets a new correlation id and this handle's
    /// reply queue as `reply_to`, and a reply slot is opened for it before it
    /// is sent, so a reply arriving before [`QueueHandle::reply_of`] is kept.
    /// Opening the slot is best effort: when the registry is full the message
    /// is still sent, and `reply_of` opens its slot on demand.
    ///
    /// # Parameters
    /// * `content` - Message body, encoded for the effective content type
    /// * `options` - Per-message overrides for content type, correlation id,
    ///   `reply_to` and headers
    ///
    /// # Returns
    /// The envelope that was sent, detached from the queue. Does not wait for
    /// delivery. Fails only when the body cannot be encoded or the send fails.
    pub async fn publish(
        &self,
        content: impl Into<Content>,
        options: PublishOptions,
    ) -> Result<Envelope, AmqpError> {
        let content = content.into();
        let body = content.encode(self.content_type(&options))?;
        let channel = self.channel().await?;
        let mut properties = self.properties(options);

        let mut reservation = None;
        if let Some(rpc) = &self.inner.rpc {
            let id = Uuid::new_v4().to_string();
            match rpc.registry.reserve(&id) {
                Ok(generation) => reservation = Some((rpc, id.clone(), generation)),
                Err(err) => warn!(
                    error = err.to_string(),
                    correlation_id = id,
                    "publishing without a reply slot"
                ),
            }
            properties.correlation_id = Some(id);
            properties.reply_to = Some(rpc.listener.queue_name().to_owned());
        }

        if let Err(err) = channel.send_to_queue(self.name(), &body, &properties).await {
            if let Some((rpc, id, generation)) = reservation {
                rpc.registry.release(&id, generation);
            }
            return Err(err);
        }

        debug!(
            queue = self.name(),
            correlation_id = properties.correlation_id.clone().unwrap_or_default(),
            "message published"
        );

        Ok(Envelope::detached(content, properties))
    }

    /// Waits for the reply to an earlier request.
    ///
    /// # Parameters
    /// * `target` - A correlation id, or the envelope returned by `publish`
    ///
    /// # Returns
    /// The first reply carrying the correlation id. Fails with `ReplyTimeout`
    /// once the definition's reply timeout has passed since the slot was
    /// opened, and with `RegistryFull` when no slot is left to wait on.
    /// Dropping the future gives the slot up. A JSON reply that does not parse
    /// is returned as raw bytes.
    pub async fn reply_of<'a>(
        &self,
        target: impl Into<ReplyTarget<'a>>,
    ) -> Result<Envelope, AmqpError> {
        let rpc = self.rpc()?;

        let id = match target.into() {
            ReplyTarget::Id(id) => id,
            ReplyTarget::Message(envelope) => envelope
                .correlation_id()
                .ok_or(AmqpError::MissingCorrelationId)?,
        };

        let delivery = rpc.registry.claim(id)?.wait().await?;
        let content = Content::decode_lenient(delivery.body, self.inner.definition.content_type);

        Ok(Envelope::detached(content, delivery.properties))
    }

    /// Publishes a request and waits for its reply.
    pub async fn request(
        &self,
        content: impl Into<Content>,
        options: PublishOptions,
    ) -> Result<Envelope, AmqpError> {
        self.rpc()?;
        let sent = self.publish(content, options).await?;
        self.reply_of(&sent).await
    }

    /// Sends a reply to `options.reply_to`, tagged with `options.correlation_id`.
    ///
    /// Content is encoded the same way `publish` encodes it. No queue is
    /// declared and no correlation id is generated.
    pub async fn reply(
        &self,
        content: impl Into<Content>,
        options: PublishOptions,
    ) -> Result<Envelope, AmqpError> {
        let Some(reply_to) = options.reply_to.clone() else {
            return Err(AmqpError::MissingReplyTo);
        };

        let content = content.into();
        let body = content.encode(self.content_type(&options))?;
        let channel = self.channel().await?;
        let properties = self.properties(options);

        channel.send_to_queue(&reply_to, &body, &properties).await?;
        debug!(
            reply_to = reply_to,
            correlation_id = properties.correlation_id.clone().unwrap_or_default(),
            "reply sent"
        );

        Ok(Envelope::detached(content, properties))
    }

    /// Acknowledges a delivered message.
    ///
    /// # Parameters
    /// * `envelope` - Envelope received through [`QueueHandle::subscribe`]
    ///
    /// # Returns
    /// `Ok` once acknowledged, or right away for auto-ack deliveries.
    /// `DetachedEnvelope` when the envelope was never delivered.
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let Some(delivery_tag) = envelope.delivery_tag else {
            return Err(AmqpError::DetachedEnvelope);
        };

        if envelope.auto_ack {
            return Ok(());
        }

        self.channel().await?.ack(delivery_tag).await
    }

    /// Discards every ready message in the queue, returning how many were removed.
    pub async fn purge(&self) -> Result<u32, AmqpError> {
        let count = self.channel().await?.purge_queue(self.name()).await?;
        debug!(queue = self.name(), count = count, "queue purged");
        Ok(count)
    }

    /// Starts a consumer on the queue and feeds every delivery to `handler`.
    ///
    /// Deliveries are handled one at a time, in queue order, each under a
    /// consumer span parented on the trace context found in its headers. When
    /// a prefetch is configured it is applied to the channel first, which
    /// affects every consumer sharing that channel.
    ///
    /// A body that does not decode for the subscription's content type reaches
    /// the handler as `Err(ParsePayloadError)`. On manual-ack subscriptions
    /// that delivery is acknowledged once the handler returns, since no
    /// envelope exists for the handler to ack.
    ///
    /// # Parameters
    /// * `handler` - Receives each message, or the error that replaced it
    /// * `options` - Per-subscription prefetch, content type, ack mode and exclusivity
    ///
    /// # Returns
    /// A [`Subscription`] for the running consumer.
    pub async fn subscribe<H>(
        &self,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        let definition = &self.inner.definition;
        let content_type = options.content_type.unwrap_or(definition.content_type);
        let consume = ConsumeOptions {
            no_ack: options.no_ack.unwrap_or(definition.no_ack),
            exclusive: options.exclusive.unwrap_or(false),
        };

        let channel = self.channel().await?;

        if let Some(count) = options.prefetch.or(definition.prefetch) {
            channel.prefetch(count).await?;
        }

        let mut deliveries = channel.consume(self.name(), &consume).await?;
        debug!(queue = self.name(), "consumer started");

        let handle = self.clone();
        let task = tokio::spawn(async move {
            let tracer = global::tracer(otel::TRACER_NAME);

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        handle
                            .dispatch(&tracer, &handler, delivery, content_type, consume.no_ack)
                            .await
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = handle.name(), "errors consume msg");
                        handler.exec(Err(err)).await;
                    }
                }
            }

            debug!(queue = handle.name(), "consumer finished");
        });

        Ok(Subscription {
            queue: self.name().to_owned(),
            task,
        })
    }

    async fn dispatch<H: MessageHandler>(
        &self,
        tracer: &BoxedTracer,
        handler: &H,
        delivery: Delivery,
        content_type: ContentType,
        auto_ack: bool,
    ) {
        let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, self.name());

        let Delivery {
            delivery_tag,
            body,
            properties,
        } = delivery;

        let message = match Content::decode(body, content_type) {
            Ok(content) => {
                span.set_status(Status::Ok);
                Ok(Envelope::delivered(
                    content,
                    properties,
                    delivery_tag,
                    auto_ack,
                    self.clone(),
                ))
            }
            Err(err) => {
                warn!(error = err.to_string(), queue = self.name(), "failure to decode msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to parse payload"),
                });
                Err(err)
            }
        };

        let undecodable = message.is_err();
        let cx = ctx.with_span(span);
        handler.exec(message).with_context(cx.clone()).await;

        if undecodable && !auto_ack {
            if let Err(err) = self.settle(delivery_tag).await {
                error!(error = err.to_string(), queue = self.name(), "error whiling ack msg");
                cx.span().set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
            }
        }

        cx.span().end();
    }

    async fn settle(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel().await?.ack(delivery_tag).await?;
        debug!(queue = self.name(), delivery_tag = delivery_tag, "undecodable msg acked");
        Ok(())
    }

    fn rpc(&self) -> Result<&Rpc, AmqpError> {
        self.inner
            .rpc
            .as_ref()
            .ok_or_else(|| AmqpError::RpcNotEnabled(self.name().to_owned()))
    }

    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.inner.provider.channel().await
    }

    fn content_type(&self, options: &PublishOptions) -> ContentType {
        options
            .content_type
            .unwrap_or(self.inner.definition.content_type)
    }

    fn properties(&self, options: PublishOptions) -> MessageProperties {
        let content_type = self.content_type(&options);
        let mut headers = options.headers;
        otel::inject_current(&mut headers);

        MessageProperties {
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            content_type: Some(content_type),
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
        }
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("queue", &self.inner.queue)
            .field("reply_queue", &self.reply_queue())
            .finish()
    }
}

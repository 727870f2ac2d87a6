// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the channel capability over a real RabbitMQ
//! connection using lapin. [`LapinChannelProvider`] connects lazily on first
//! use and shares one channel between every handle created from it.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    message::{ContentType, MessageProperties},
    provider::{
        AmqpChannel, ChannelProvider, ConsumeOptions, DeclareOptions, DeclaredQueue, Delivery,
        DeliveryStream,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

/// Creates a new AMQP connection and channel for communication with RabbitMQ.
///
/// # Parameters
/// * `cfg` - RabbitMQ connection details like host, port, credentials, etc.
///
/// # Returns
/// A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

/// Channel provider backed by a lapin connection.
pub struct LapinChannelProvider {
    cfg: RabbitMQConfigs,
    state: OnceCell<(Arc<Connection>, Arc<LapinChannel>)>,
}

impl LapinChannelProvider {
    /// Creates a provider that connects on first use.
    ///
    /// # Parameters
    /// * `cfg` - RabbitMQ connection details
    ///
    /// # Returns
    /// A shareable provider. No connection is attempted until the first channel is requested.
    pub fn new(cfg: RabbitMQConfigs) -> Arc<LapinChannelProvider> {
        Arc::new(LapinChannelProvider {
            cfg,
            state: OnceCell::new(),
        })
    }

    /// Creates a provider around an already open connection and channel.
    ///
    /// # Parameters
    /// * `conn` - Open connection, kept alive by the provider
    /// * `channel` - Channel shared by every handle created from the provider
    pub fn from_channel(conn: Arc<Connection>, channel: Arc<Channel>) -> Arc<LapinChannelProvider> {
        Arc::new(LapinChannelProvider {
            cfg: RabbitMQConfigs::default(),
            state: OnceCell::new_with(Some((conn, LapinChannel::new(channel)))),
        })
    }

    /// The underlying connection, opening it if needed.
    pub async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let (conn, _) = self.state().await?;
        Ok(conn.clone())
    }

    async fn state(&self) -> Result<&(Arc<Connection>, Arc<LapinChannel>), AmqpError> {
        self.state
            .get_or_try_init(|| async {
                let (conn, channel) = new_amqp_channel(&self.cfg).await?;
                Ok::<_, AmqpError>((conn, LapinChannel::new(channel)))
            })
            .await
    }
}

#[async_trait]
impl ChannelProvider for LapinChannelProvider {
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let (_, channel) = self.state().await?;
        let channel: Arc<dyn AmqpChannel> = channel.clone();
        Ok(channel)
    }
}

/// [`AmqpChannel`] implementation over a lapin channel.
///
/// Queues are addressed through the default exchange, so `send_to_queue`
/// publishes with the queue name as routing key. Prefetch is applied per
/// consumer (`global: false`) on this channel.
pub struct LapinChannel {
    channel: Arc<Channel>,
}

impl LapinChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Arc<Channel>) -> Arc<LapinChannel> {
        Arc::new(LapinChannel { channel })
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: &DeclareOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(DeclaredQueue {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error publishing message");
                Err(AmqpError::PublishingError(queue.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    properties: message_properties(&delivery.properties),
                    body: delivery.data,
                }),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to purge the queue");
                Err(AmqpError::PurgeQueueError(queue.to_owned()))
            }
            Ok(count) => Ok(count),
        }
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Converts declare arguments to an AMQP field table.
fn field_table(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in arguments {
        let amqp_value = match value {
            Value::Bool(v) => AMQPValue::Boolean(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
                None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            Value::Null => AMQPValue::Void,
            other => AMQPValue::LongString(LongString::from(other.to_string())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in &props.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut properties = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(content_type) = props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_mime()));
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(id) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(id.clone()));
    }

    properties
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                match std::str::from_utf8(value.as_bytes()) {
                    Ok(value) => {
                        headers.insert(key.to_string(), value.to_owned());
                    }
                    Err(err) => error!("Error decoding header value {:?}", err),
                }
            }
        }
    }

    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        content_type: props
            .content_type()
            .as_ref()
            .and_then(|v| ContentType::from_mime(v.as_str())),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        headers,
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Capability
//!
//! The queue layer never talks to a broker client directly. It goes through
//! the two traits in this module: a [`ChannelProvider`] that hands out a live
//! channel, and the [`AmqpChannel`] operations a queue handle needs. The lapin
//! adapter in [`crate::channel`] and the in-process broker in
//! [`crate::memory`] both implement them.

use crate::{errors::AmqpError, message::MessageProperties};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Options for declaring (asserting) a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, Value>,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Queue name, assigned by the server when declared with an empty name.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Options for starting a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// A message as received from the broker, body still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Operations a queue handle performs on a broker channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares the queue, creating it when missing.
    ///
    /// # Parameters
    /// * `name` - Queue name, empty for a server-named queue
    /// * `options` - Durability, exclusivity, auto-delete and declare arguments
    ///
    /// # Returns
    /// The declared queue with its final name, or `DeclareQueueError` when the
    /// queue exists with incompatible options.
    async fn assert_queue(
        &self,
        name: &str,
        options: &DeclareOptions,
    ) -> Result<DeclaredQueue, AmqpError>;

    /// Sends a message to a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer on the queue.
    ///
    /// # Returns
    /// A stream yielding every delivery in queue order. Transport failures
    /// while consuming arrive as `Err` items.
    async fn consume(&self, queue: &str, options: &ConsumeOptions)
        -> Result<DeliveryStream, AmqpError>;

    /// Acknowledges one delivery by its tag.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Removes every ready message from the queue and returns how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Sets the prefetch limit for every consumer on the channel.
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;
}

/// Supplies a live channel on demand. Connection management is the provider's concern.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker living in the current process that implements the channel
//! capability with the queue semantics the queue layer relies on:
//! server-named queues, buffering while a queue has no consumer, round-robin
//! delivery between consumers, delivery tags with ack tracking, and purge.
//! Messages sent to a queue that does not exist are dropped, like the default
//! exchange does.
//!
//! Useful for tests and for running services without a RabbitMQ server.

use crate::{
    errors::AmqpError,
    message::MessageProperties,
    provider::{
        AmqpChannel, ChannelProvider, ConsumeOptions, DeclareOptions, DeclaredQueue, Delivery,
        DeliveryStream,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

struct Consumer {
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
    no_ack: bool,
}

struct MemoryQueue {
    options: DeclareOptions,
    ready: VecDeque<(Vec<u8>, MessageProperties)>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, String>,
    next_tag: u64,
    prefetch: Option<u16>,
}

impl BrokerState {
    fn push(&mut self, queue_name: &str, body: Vec<u8>, properties: MessageProperties) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            debug!(queue = queue_name, "dropping message for unknown queue");
            return;
        };

        queue.consumers.retain(|c| !c.sender.is_closed());
        if queue.consumers.is_empty() {
            queue.ready.push_back((body, properties));
            return;
        }

        let index = queue.next_consumer % queue.consumers.len();
        queue.next_consumer = index + 1;
        let consumer = &queue.consumers[index];

        self.next_tag += 1;
        let delivery_tag = self.next_tag;
        if !consumer.no_ack {
            self.unacked.insert(delivery_tag, queue_name.to_owned());
        }

        let _ = consumer.sender.send(Ok(Delivery {
            delivery_tag,
            body,
            properties,
        }));
    }
}

/// In-process broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker with no queues.
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// The broker as a channel provider, ready to hand to a queue handle.
    pub fn provider(&self) -> Arc<dyn ChannelProvider> {
        Arc::new(self.clone())
    }

    /// Messages waiting in the queue.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to inspect
    ///
    /// # Returns
    /// Ready messages not yet handed to a consumer, `None` if the queue does not exist.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    /// Deliveries handed out and not yet acknowledged.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Last prefetch limit set on the channel.
    pub fn prefetch_count(&self) -> Option<u16> {
        self.state().prefetch
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChannelProvider for MemoryBroker {
    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel: Arc<dyn AmqpChannel> = Arc::new(self.clone());
        Ok(channel)
    }
}

#[async_trait]
impl AmqpChannel for MemoryBroker {
    async fn assert_queue(
        &self,
        name: &str,
        options: &DeclareOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        let mut state = self.state();

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.options.durable != options.durable
                || existing.options.exclusive != options.exclusive
            {
                warn!(queue = name, "queue redeclared with different options");
                return Err(AmqpError::DeclareQueueError(name));
            }

            return Ok(DeclaredQueue {
                message_count: existing.ready.len() as u32,
                consumer_count: existing.consumers.len() as u32,
                name,
            });
        }

        state.queues.insert(
            name.clone(),
            MemoryQueue {
                options: options.clone(),
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            },
        );
        debug!(queue = name, "queue created");

        Ok(DeclaredQueue {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.state().push(queue, body.to_vec(), properties.clone());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state();

        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        memory_queue.consumers.push(Consumer {
            sender,
            no_ack: options.no_ack,
        });

        let waiting: Vec<_> = memory_queue.ready.drain(..).collect();
        for (body, properties) in waiting {
            state.push(queue, body, properties);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self.state().unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => {
                warn!(delivery_tag = delivery_tag, "unknown delivery tag");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.state();
        let Some(memory_queue) = state.queues.get_mut(queue) else {
            return Err(AmqpError::PurgeQueueError(queue.to_owned()));
        };

        let count = memory_queue.ready.len() as u32;
        memory_queue.ready.clear();
        Ok(count)
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.state().prefetch = Some(count);
        Ok(())
    }
}

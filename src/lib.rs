// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Typed queue handles over an AMQP broker.
//!
//! A [`QueueHandle`] declares one queue and offers publish, subscribe,
//! acknowledgement, purge and request/reply on it. Request/reply is built on
//! plain queues: each rpc handle owns a private reply queue and a correlation
//! registry that matches replies to the calls waiting for them.
//!
//! ```no_run
//! use rabbitmq_queue::{
//!     channel::LapinChannelProvider, configs::RabbitMQConfigs, handle::QueueHandle,
//!     message::PublishOptions, queue::QueueOptions,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), rabbitmq_queue::errors::AmqpError> {
//! let provider = LapinChannelProvider::new(RabbitMQConfigs::default());
//! let jobs = QueueHandle::with_options(
//!     provider,
//!     None,
//!     Some(&QueueOptions::new().name("jobs").rpc(true).json()),
//! )
//! .await?;
//!
//! let reply = jobs.request(json!({"task": "x"}), PublishOptions::default()).await?;
//! println!("{:?}", reply.content);
//! # Ok(())
//! # }
//! ```

mod listener;
mod otel;
mod registry;

pub mod channel;
pub mod configs;
pub mod errors;
pub mod handle;
pub mod memory;
pub mod message;
pub mod provider;
pub mod queue;

pub use errors::AmqpError;
pub use handle::{MessageHandler, QueueHandle, ReplyTarget, Subscription};
pub use message::{Content, ContentType, Envelope, MessageProperties, PublishOptions, SubscribeOptions};
pub use queue::{QueueDefinition, QueueMetadata, QueueOptions};

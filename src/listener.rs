// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Listener
//!
//! Background consumer on a handle's private reply queue. Every delivery is
//! handed, still encoded, to the correlation registry. Replies nobody waits
//! for are discarded.

use crate::{
    errors::AmqpError,
    provider::{AmqpChannel, ConsumeOptions, DeclareOptions, DeclaredQueue},
    registry::CorrelationRegistry,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A running reply listener. Stops when dropped.
pub(crate) struct ReplyListener {
    queue: DeclaredQueue,
    task: JoinHandle<()>,
}

impl ReplyListener {
    /// Declares an anonymous exclusive reply queue and starts consuming it.
    pub(crate) async fn start(
        channel: &dyn AmqpChannel,
        registry: Arc<CorrelationRegistry>,
    ) -> Result<ReplyListener, AmqpError> {
        let queue = channel
            .assert_queue(
                "",
                &DeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..DeclareOptions::default()
                },
            )
            .await?;
        debug!(queue = queue.name, "reply queue declared");

        let mut deliveries = channel
            .consume(
                &queue.name,
                &ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                },
            )
            .await?;

        let name = queue.name.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        let correlation_id = delivery.properties.correlation_id.clone();
                        if !registry.resolve(delivery) {
                            debug!(
                                queue = name,
                                correlation_id = correlation_id.unwrap_or_default(),
                                "discarding reply without waiter"
                            );
                        }
                    }
                    Err(err) => error!(error = err.to_string(), queue = name, "errors consume reply"),
                }
            }
            debug!(queue = name, "reply consumer finished");
        });

        Ok(ReplyListener { queue, task })
    }

    pub(crate) fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

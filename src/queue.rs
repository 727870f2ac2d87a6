// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the types used to describe a queue before a
//! [`QueueHandle`](crate::handle::QueueHandle) is created for it.
//!
//! A [`QueueDefinition`] is the effective, immutable configuration of a queue.
//! It is built from layers of [`QueueOptions`]: the defaults first, then the
//! declarative options attached to a queue type (see [`QueueMetadata`]), then
//! explicit runtime options. Later layers win field by field and a field left
//! unset in a layer never erases an earlier value.

use crate::{message::ContentType, provider::DeclareOptions};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};

/// Default time an RPC caller waits for its reply
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;
/// Default bound on outstanding RPC calls per queue handle
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 10_000;

/// Declarative queue configuration supplied by a type.
///
/// Implement this for a marker type to attach static options to a queue, then
/// create the handle with [`QueueHandle::for_metadata`](crate::handle::QueueHandle::for_metadata).
pub trait QueueMetadata {
    fn queue_options() -> QueueOptions;
}

/// One layer of queue options. Every field is optional.
///
/// This struct implements the builder pattern and can also be deserialized,
/// so a layer may come from code or from a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    pub no_ack: Option<bool>,
    pub rpc: Option<bool>,
    pub content_type: Option<ContentType>,
    pub prefetch: Option<u16>,
    pub reply_timeout_ms: Option<u64>,
    pub max_pending_replies: Option<usize>,
    /// Transport specific declare arguments, merged key by key.
    pub arguments: BTreeMap<String, Value>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = Some(no_ack);
        self
    }

    /// Enables request/reply on the queue, giving the handle a private reply queue.
    pub fn rpc(mut self, rpc: bool) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn json(self) -> Self {
        self.content_type(ContentType::Json)
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Sets the reply timeout. Durations beyond `u64::MAX` milliseconds saturate.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn max_pending_replies(mut self, max: usize) -> Self {
        self.max_pending_replies = Some(max);
        self
    }

    /// Adds a declare argument such as `x-message-ttl`.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Effective configuration of a queue, immutable once a handle owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) no_ack: bool,
    pub(crate) rpc: bool,
    pub(crate) content_type: ContentType,
    pub(crate) prefetch: Option<u16>,
    pub(crate) reply_timeout_ms: u64,
    pub(crate) max_pending_replies: usize,
    pub(crate) arguments: BTreeMap<String, Value>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition {
            name: String::new(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_ack: true,
            rpc: false,
            content_type: ContentType::Raw,
            prefetch: None,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
            arguments: BTreeMap::new(),
        }
    }
}

impl QueueDefinition {
    /// Creates a definition for `name` with default settings.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition::build(None, Some(&QueueOptions::new().name(name)))
    }

    /// Merges the defaults, the declarative layer and the runtime layer, in that order.
    pub fn build(
        declared: Option<&QueueOptions>,
        runtime: Option<&QueueOptions>,
    ) -> QueueDefinition {
        let mut def = QueueDefinition::default();
        for layer in [declared, runtime].into_iter().flatten() {
            def.apply(layer);
        }
        def
    }

    /// Overlays one layer on this definition.
    pub fn apply(&mut self, layer: &QueueOptions) {
        if let Some(name) = &layer.name {
            self.name = name.clone();
        }
        if let Some(durable) = layer.durable {
            self.durable = durable;
        }
        if let Some(exclusive) = layer.exclusive {
            self.exclusive = exclusive;
        }
        if let Some(auto_delete) = layer.auto_delete {
            self.auto_delete = auto_delete;
        }
        if let Some(no_ack) = layer.no_ack {
            self.no_ack = no_ack;
        }
        if let Some(rpc) = layer.rpc {
            self.rpc = rpc;
        }
        if let Some(content_type) = layer.content_type {
            self.content_type = content_type;
        }
        if let Some(prefetch) = layer.prefetch {
            self.prefetch = Some(prefetch);
        }
        if let Some(ms) = layer.reply_timeout_ms {
            self.reply_timeout_ms = ms;
        }
        if let Some(max) = layer.max_pending_replies {
            self.max_pending_replies = max;
        }
        for (key, value) in &layer.arguments {
            self.arguments.insert(key.clone(), value.clone());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn no_ack(&self) -> bool {
        self.no_ack
    }

    pub fn rpc(&self) -> bool {
        self.rpc
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn max_pending_replies(&self) -> usize {
        self.max_pending_replies
    }

    pub fn arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    pub(crate) fn declare_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.arguments.clone(),
        }
    }
}

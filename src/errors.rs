// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Layer
//!
//! This module provides the error type shared by every queue operation.
//! The `AmqpError` enum covers channel acquisition, queue declaration,
//! publishing, consuming, acknowledgement, payload encoding and the RPC
//! correlation layer.

use thiserror::Error;

/// Represents errors that can occur during queue operations.
///
/// Transport variants are produced where a broker call fails and are handed
/// back unchanged to the caller; no retry is performed. `ReplyTimeout` is kept
/// apart from the transport variants so callers can tell "broker error" from
/// "no one answered".
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message to the given queue
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error serializing a payload to JSON
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a JSON payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A reply was requested but no reply-to address is known
    #[error("missing reply-to address")]
    MissingReplyTo,

    /// A reply was awaited for a message that carries no correlation id
    #[error("missing correlation id")]
    MissingCorrelationId,

    /// RPC operations were called on a queue declared without `rpc`
    #[error("queue `{0}` is not rpc enabled")]
    RpcNotEnabled(String),

    /// `ack` or `reply` was called on an envelope that was not delivered by a subscription
    #[error("envelope is not attached to a queue")]
    DetachedEnvelope,

    /// No reply arrived for the correlation id before its deadline
    #[error("timed out waiting for reply `{0}`")]
    ReplyTimeout(String),

    /// A waiter is already registered for the correlation id
    #[error("correlation id `{0}` is already awaited")]
    DuplicateCorrelationId(String),

    /// The correlation registry reached its configured bound
    #[error("too many pending replies, limit is {0}")]
    RegistryFull(usize),
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Envelopes
//!
//! This module defines the payload, properties and envelope types that flow
//! through a [`QueueHandle`]. An [`Envelope`] delivered by a subscription
//! carries a shared reference to the handle that produced it, which is what
//! backs its `ack` and `reply` capabilities.

use crate::{errors::AmqpError, handle::QueueHandle};
use serde::{
    de::{DeserializeOwned, IgnoredAny},
    Deserialize, Serialize,
};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for opaque binary messages
pub const RAW_CONTENT_TYPE: &str = "application/octet-stream";

/// Encoding applied to message bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Raw,
    Json,
}

impl ContentType {
    /// MIME type written to the `content_type` message property.
    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentType::Raw => RAW_CONTENT_TYPE,
            ContentType::Json => JSON_CONTENT_TYPE,
        }
    }

    /// Maps a wire MIME type back, `None` for anything unrecognised.
    pub fn from_mime(mime: &str) -> Option<ContentType> {
        match mime {
            JSON_CONTENT_TYPE => Some(ContentType::Json),
            RAW_CONTENT_TYPE => Some(ContentType::Raw),
            _ => None,
        }
    }
}

/// Message body: opaque bytes, text, or a JSON value.
///
/// Text is what string literals turn into. It goes out as-is on raw queues
/// and as a JSON string on JSON queues. Received messages are always `Raw`
/// or `Json`.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Raw(Vec<u8>),
    Text(String),
    Json(Value),
}

impl Content {
    /// Serializes any `Serialize` value into JSON content.
    pub fn json<T: Serialize>(value: &T) -> Result<Content, AmqpError> {
        match serde_json::to_value(value) {
            Ok(v) => Ok(Content::Json(v)),
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                Err(AmqpError::SerializePayloadError(err.to_string()))
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Raw(bytes) => Some(bytes),
            Content::Text(text) => Some(text.as_bytes()),
            Content::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Deserializes the content into `T`, parsing raw bytes as JSON text.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        let parsed = match self {
            Content::Json(value) => serde_json::from_value(value.clone()),
            Content::Raw(bytes) => serde_json::from_slice(bytes),
            Content::Text(text) => serde_json::from_str(text),
        };

        parsed.map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Produces the bytes put on the wire for the given content type.
    ///
    /// # Parameters
    /// * `content_type` - Effective content type of the outgoing message
    ///
    /// # Returns
    /// The message body. Under `Json` every body is UTF-8 JSON text: values
    /// are serialized, text becomes a JSON string, and raw bytes must already
    /// be valid JSON or `SerializePayloadError` is returned. Under `Raw`, bytes
    /// and text go out verbatim.
    pub(crate) fn encode(&self, content_type: ContentType) -> Result<Vec<u8>, AmqpError> {
        let encoded = match (self, content_type) {
            (Content::Raw(bytes), ContentType::Raw) => return Ok(bytes.clone()),
            (Content::Text(text), ContentType::Raw) => return Ok(text.as_bytes().to_vec()),
            (Content::Raw(bytes), ContentType::Json) => {
                serde_json::from_slice::<IgnoredAny>(bytes).map(|_| bytes.clone())
            }
            (Content::Text(text), ContentType::Json) => serde_json::to_vec(text),
            (Content::Json(value), _) => serde_json::to_vec(value),
        };

        encoded.map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })
    }

    /// Decodes a received body according to the consumer's content type.
    pub(crate) fn decode(body: Vec<u8>, content_type: ContentType) -> Result<Content, AmqpError> {
        match content_type {
            ContentType::Raw => Ok(Content::Raw(body)),
            ContentType::Json => serde_json::from_slice(&body)
                .map(Content::Json)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
        }
    }

    /// Like `decode`, but falls back to the raw bytes when the body is not valid JSON.
    pub(crate) fn decode_lenient(body: Vec<u8>, content_type: ContentType) -> Content {
        match content_type {
            ContentType::Raw => Content::Raw(body),
            ContentType::Json => match serde_json::from_slice(&body) {
                Ok(value) => Content::Json(value),
                Err(_) => Content::Raw(body),
            },
        }
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Raw(value)
    }
}

impl From<&[u8]> for Content {
    fn from(value: &[u8]) -> Self {
        Content::Raw(value.to_vec())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_owned())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Json(value)
    }
}

/// Message properties carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<ContentType>,
    pub message_id: Option<String>,
    /// String headers, used for trace context propagation.
    pub headers: BTreeMap<String, String>,
}

/// Per-call overlay for `publish` and `reply`.
///
/// Values set here apply to a single message and never change the handle's
/// queue definition.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub content_type: Option<ContentType>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        PublishOptions::default()
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Per-subscription overlay for `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Channel-wide prefetch limit set before consuming starts.
    pub prefetch: Option<u16>,
    pub content_type: Option<ContentType>,
    pub no_ack: Option<bool>,
    pub exclusive: Option<bool>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        SubscribeOptions::default()
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Requires explicit acknowledgement of every delivery.
    pub fn manual_ack(mut self) -> Self {
        self.no_ack = Some(false);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = Some(true);
        self
    }
}

/// A message together with its properties.
///
/// Envelopes handed to a subscriber keep a reference to their queue handle so
/// they can be acknowledged or answered. Envelopes returned by `publish`,
/// `reply` or `reply_of` are detached.
#[derive(Clone)]
pub struct Envelope {
    pub content: Content,
    pub properties: MessageProperties,
    pub(crate) delivery_tag: Option<u64>,
    pub(crate) auto_ack: bool,
    pub(crate) queue: Option<QueueHandle>,
}

impl Envelope {
    pub(crate) fn detached(content: Content, properties: MessageProperties) -> Self {
        Envelope {
            content,
            properties,
            delivery_tag: None,
            auto_ack: false,
            queue: None,
        }
    }

    pub(crate) fn delivered(
        content: Content,
        properties: MessageProperties,
        delivery_tag: u64,
        auto_ack: bool,
        queue: QueueHandle,
    ) -> Self {
        Envelope {
            content,
            properties,
            delivery_tag: Some(delivery_tag),
            auto_ack,
            queue: Some(queue),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    /// Acknowledges this delivery on its queue's channel.
    ///
    /// Does nothing for deliveries received with automatic acknowledgement.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }

        let Some(queue) = &self.queue else {
            return Err(AmqpError::DetachedEnvelope);
        };

        queue.ack(self).await
    }

    /// Answers the caller that sent this message.
    ///
    /// The reply goes to this message's `reply_to` and carries its
    /// `correlation_id`, overriding whatever `options` says for either.
    pub async fn reply(
        &self,
        content: impl Into<Content>,
        options: PublishOptions,
    ) -> Result<Envelope, AmqpError> {
        let Some(queue) = &self.queue else {
            return Err(AmqpError::DetachedEnvelope);
        };

        let Some(reply_to) = &self.properties.reply_to else {
            return Err(AmqpError::MissingReplyTo);
        };

        let options = PublishOptions {
            reply_to: Some(reply_to.clone()),
            correlation_id: self.properties.correlation_id.clone(),
            ..options
        };

        queue.reply(content, options).await
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("content", &self.content)
            .field("properties", &self.properties)
            .field("delivery_tag", &self.delivery_tag)
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_content_is_encoded_as_utf8_text() {
        let content = Content::from(json!({"task": "x"}));
        assert_eq!(
            content.encode(ContentType::Json).unwrap(),
            br#"{"task":"x"}"#.to_vec()
        );
    }

    #[test]
    fn raw_content_is_sent_verbatim() {
        let content = Content::from(&[0u8, 159, 146, 150][..]);
        assert_eq!(
            content.encode(ContentType::Raw).unwrap(),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn text_becomes_a_json_string_on_json_queues() {
        let content = Content::from("hello");
        assert_eq!(content.encode(ContentType::Json).unwrap(), br#""hello""#.to_vec());
        assert_eq!(content.encode(ContentType::Raw).unwrap(), b"hello".to_vec());

        let body = content.encode(ContentType::Json).unwrap();
        assert_eq!(
            Content::decode(body, ContentType::Json).unwrap(),
            Content::Json(json!("hello"))
        );
    }

    #[test]
    fn raw_bytes_must_be_json_on_json_queues() {
        let valid = Content::from(&br#"{"a":1}"#[..]);
        assert_eq!(valid.encode(ContentType::Json).unwrap(), br#"{"a":1}"#.to_vec());

        let invalid = Content::from(&b"{oops"[..]);
        assert!(matches!(
            invalid.encode(ContentType::Json),
            Err(AmqpError::SerializePayloadError(_))
        ));
    }

    #[test]
    fn strict_decode_reports_malformed_json() {
        let result = Content::decode(b"{not json".to_vec(), ContentType::Json);
        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[test]
    fn lenient_decode_keeps_raw_body() {
        let content = Content::decode_lenient(b"{not json".to_vec(), ContentType::Json);
        assert_eq!(content, Content::Raw(b"{not json".to_vec()));

        let content = Content::decode_lenient(br#"{"status":"ok"}"#.to_vec(), ContentType::Json);
        assert_eq!(content, Content::Json(json!({"status": "ok"})));
    }

    #[test]
    fn raw_bodies_are_not_decoded() {
        let content = Content::decode(br#"{"a":1}"#.to_vec(), ContentType::Raw).unwrap();
        assert_eq!(content, Content::Raw(br#"{"a":1}"#.to_vec()));
    }

    #[test]
    fn content_type_round_trips_through_mime() {
        assert_eq!(ContentType::from_mime(ContentType::Json.as_mime()), Some(ContentType::Json));
        assert_eq!(ContentType::from_mime(ContentType::Raw.as_mime()), Some(ContentType::Raw));
        assert_eq!(ContentType::from_mime("text/plain"), None);
    }

    #[test]
    fn parse_reads_json_text() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Job {
            task: String,
        }

        let job: Job = Content::from(r#"{"task":"x"}"#).parse().unwrap();
        assert_eq!(job, Job { task: "x".to_owned() });
    }

    #[tokio::test]
    async fn detached_envelope_cannot_reply() {
        let envelope = Envelope::detached(Content::from("hi"), MessageProperties::default());
        let result = envelope.reply("back", PublishOptions::default()).await;
        assert_eq!(result.unwrap_err(), AmqpError::DetachedEnvelope);
        assert_eq!(envelope.ack().await.unwrap_err(), AmqpError::DetachedEnvelope);
    }
}

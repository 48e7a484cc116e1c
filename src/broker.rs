// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! This module defines the seam between the queue subsystem and a concrete broker.
//! Pools, publishers, consumers and the dead-letter handler only talk to these traits;
//! the AMQP implementation lives in [`crate::amqp`].
//!
//! - [`Connector`]: opens new connections for one configured queue
//! - [`BrokerConnection`]: a live connection that can open channels
//! - [`BrokerChannel`]: declares queues, publishes and consumes
//! - [`Acknowledger`]: the delivery handle used to settle one inbound message

use crate::{errors::QueueError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, fmt, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for plain text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for bodies that are neither JSON nor UTF-8 text
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// String message headers, also used as the trace-context carrier.
pub type Headers = HashMap<String, String>;

/// Stream of deliveries produced by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, QueueError>>;

/// Opens connections to the broker backing one queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError>;
}

/// A live broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Opens a channel, optionally with publisher confirms enabled.
    async fn open_channel(
        &self,
        publisher_confirms: bool,
    ) -> Result<Arc<dyn BrokerChannel>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// A channel on a broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declares the queue (idempotent) and returns the number of ready messages.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, QueueError>;

    /// Limits the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError>;

    /// Publishes through the default exchange and waits for the broker confirm when enabled.
    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), QueueError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Delivery handle of one inbound message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A message ready to be handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_type: Option<String>,
    pub message_id: String,
    pub headers: Headers,
}

/// A message delivered by the broker.
#[derive(Clone)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    /// Type declared in the message properties, if any
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub routing_key: String,
    pub headers: Headers,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(body: Vec<u8>, routing_key: &str, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            body,
            message_type: None,
            message_id: None,
            routing_key: routing_key.to_owned(),
            headers: Headers::default(),
            redelivered: false,
            acker,
        }
    }

    pub fn with_message_type(mut self, message_type: Option<String>) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn acker(&self) -> Arc<dyn Acknowledger> {
        self.acker.clone()
    }

    /// Body as text, with invalid UTF-8 replaced. Used for logging.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("routing_key", &self.routing_key)
            .field("message_type", &self.message_type)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

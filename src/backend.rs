// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Backends
//!
//! The broker type of a queue descriptor selects a [`QueueBackend`]. Supporting another
//! broker means adding a variant and its [`Connector`].

use crate::{amqp::AmqpConnector, broker::Connector, config::QueueDescriptor, errors::QueueError};
use std::{fmt, str::FromStr, sync::Arc};

/// Builds the connector of a queue. The default opens real broker connections; tests
/// substitute an in-memory broker.
pub type ConnectorFactory =
    Arc<dyn Fn(QueueBackend, &QueueDescriptor) -> Result<Arc<dyn Connector>, QueueError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueBackend {
    /// RabbitMQ and other AMQP 0.9.1 brokers
    Amqp,
}

impl QueueBackend {
    pub fn for_descriptor(descriptor: &QueueDescriptor) -> Result<Self, QueueError> {
        descriptor.broker.parse()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::Amqp => "rabbitmq",
        }
    }

    /// Creates the connector for `descriptor` on this backend.
    pub fn connector(&self, descriptor: &QueueDescriptor) -> Result<Arc<dyn Connector>, QueueError> {
        match self {
            QueueBackend::Amqp => Ok(Arc::new(AmqpConnector::new(descriptor)?)),
        }
    }
}

impl FromStr for QueueBackend {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rabbitmq" | "amqp" => Ok(QueueBackend::Amqp),
            _ => Err(QueueError::UnsupportedQueueType(s.to_owned())),
        }
    }
}

impl fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector factory backed by the real broker clients.
pub fn default_connector_factory() -> ConnectorFactory {
    Arc::new(|backend: QueueBackend, descriptor: &QueueDescriptor| backend.connector(descriptor))
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! This module provides the broker-side declaration of a queue. Every queue this crate
//! touches is declared durable; a queue configured with a Dead Letter Queue (DLQ) is
//! additionally declared with dead-letter arguments so that messages rejected without
//! requeue are routed by the broker into `<name>_dlq`.

use crate::config::QueueDescriptor;
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Suffix appended to a queue name to build its DLQ name
pub const DLQ_SUFFIX: &str = "_dlq";

/// Definition of a queue with its declaration parameters.
///
/// This struct implements the builder pattern used to describe queues before they
/// are declared on the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dlq_name: None,
        }
    }

    /// Builds the definition of the queue described by a configuration entry.
    pub fn from_descriptor(descriptor: &QueueDescriptor) -> QueueDefinition {
        let def = QueueDefinition::new(&descriptor.name).durable();
        if descriptor.enable_dlq {
            def.with_dlq()
        } else {
            def
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ name will be the main queue name with the "_dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(dlq_name(&self.name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Definition of the DLQ itself, if one is configured.
    pub fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name
            .as_deref()
            .map(|name| QueueDefinition::new(name).durable())
    }

    /// Declaration arguments routing rejected messages to the DLQ through the default exchange.
    pub fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();

        if let Some(dlq) = &self.dlq_name {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                String::default(),
            );
            args.insert(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(), dlq.clone());
        }

        args
    }
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("user_channel").durable();

        assert!(def.is_durable());
        assert!(def.arguments().is_empty());
        assert!(def.dlq_definition().is_none());
    }

    #[test]
    fn dlq_queue_routes_rejections_to_the_dlq() {
        let def = QueueDefinition::new("user_channel").durable().with_dlq();
        let args = def.arguments();

        assert_eq!(def.dlq_name(), Some("user_channel_dlq"));
        assert_eq!(args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE), Some(&String::new()));
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&"user_channel_dlq".to_owned())
        );

        let dlq = def.dlq_definition().unwrap();
        assert!(dlq.is_durable());
        assert!(dlq.arguments().is_empty());
    }
}

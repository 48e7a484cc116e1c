// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Subsystem
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! Transport failures (`Connection`, `Channel`, `Consume`, ack/nack failures) are
//! recovered locally by the consumer and dead-letter reconnect loops. Content failures
//! (`Serialization`, `HandlerNotFound`, `HandlerExecution`) are resolved through the
//! ack/nack/retry protocol. `CircuitOpen` and `Publishing` are surfaced to publish callers.

use thiserror::Error;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while publishing, consuming or managing queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker is unreachable or the connection was unexpectedly closed
    #[error("failure to connect `{0}`")]
    Connection(String),

    /// Error creating or using a channel on an established connection
    #[error("failure to create a channel `{0}`")]
    Channel(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueue(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclaration(String),

    /// Error creating a consumer or receiving a delivery
    #[error("failure to consume message `{0}`")]
    Consume(String),

    /// Message body is not valid JSON, lacks the `type` field or cannot be serialized
    #[error("failure to parse payload `{0}`")]
    Serialization(String),

    /// No handler registered for the message type
    #[error("no handler registered for message type `{0}`")]
    HandlerNotFound(String),

    /// The registered handler returned an error
    #[error("handler failure `{0}`")]
    HandlerExecution(String),

    /// Publish attempted while the circuit breaker is open
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Network failure or broker rejection during publish
    #[error("failure to publish `{0}`")]
    Publishing(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessage(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessage(String),

    /// The configured broker type has no backend
    #[error("unsupported queue type `{0}`")]
    UnsupportedQueueType(String),

    /// No publisher configured for the queue
    #[error("publisher for queue `{0}` not found")]
    PublisherNotFound(String),

    /// Invalid or unreadable configuration
    #[error("configuration error `{0}`")]
    Config(String),

    /// The consumer was stopped and cannot be restarted
    #[error("consumer for queue `{0}` was stopped")]
    ConsumerStopped(String),
}

impl QueueError {
    /// True for failures of the broker transport, which are recovered by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QueueError::Connection(_)
                | QueueError::Channel(_)
                | QueueError::DeclareQueue(_)
                | QueueError::QoSDeclaration(_)
                | QueueError::Consume(_)
                | QueueError::AckMessage(_)
                | QueueError::NackMessage(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

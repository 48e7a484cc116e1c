// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes text or JSON messages to a queue through the default exchange. Every
//! publish borrows a connection from the queue's pool, opens a channel with publisher
//! confirms, declares the destination and waits for the broker confirm. The network
//! part is guarded by a [`CircuitBreaker`], and the connection is always returned to
//! the pool.

use crate::{
    broker::{
        BrokerConnection, OutboundMessage, BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE,
        TEXT_CONTENT_TYPE,
    },
    circuit_breaker::{CircuitBreaker, CircuitState},
    errors::QueueError,
    otel,
    pool::ConnectionPool,
    queue::QueueDefinition,
};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Message accepted by [`Publisher::publish`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
    /// Body sent byte for byte, as when republishing a dead-lettered message.
    Raw(Vec<u8>),
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl Payload {
    /// Encodes the payload, returning the body, its content type and the message type.
    fn encode(self) -> Result<(Vec<u8>, &'static str, Option<String>), QueueError> {
        match self {
            Payload::Json(value) => {
                let body = serde_json::to_vec(&value)?;
                Ok((body, JSON_CONTENT_TYPE, message_type(&value)))
            }
            Payload::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => Ok((text.into_bytes(), JSON_CONTENT_TYPE, message_type(&value))),
                Err(_) => Ok((text.into_bytes(), TEXT_CONTENT_TYPE, None)),
            },
            Payload::Raw(body) => {
                if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                    let kind = message_type(&value);
                    Ok((body, JSON_CONTENT_TYPE, kind))
                } else if std::str::from_utf8(&body).is_ok() {
                    Ok((body, TEXT_CONTENT_TYPE, None))
                } else {
                    Ok((body, BINARY_CONTENT_TYPE, None))
                }
            }
        }
    }
}

fn message_type(value: &Value) -> Option<String> {
    value.get("type").and_then(Value::as_str).map(str::to_owned)
}

pub struct Publisher {
    definition: QueueDefinition,
    pool: Arc<ConnectionPool>,
    breaker: CircuitBreaker,
}

impl Publisher {
    pub fn new(definition: QueueDefinition, pool: Arc<ConnectionPool>) -> Self {
        let breaker = CircuitBreaker::new(definition.name());
        Self::with_breaker(definition, pool, breaker)
    }

    pub fn with_breaker(
        definition: QueueDefinition,
        pool: Arc<ConnectionPool>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            definition,
            pool,
            breaker,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.definition.name()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Publishes `message` to `queue_name`.
    ///
    /// # Parameters
    /// - `queue_name`: destination queue, declared durable before publishing
    /// - `message`: text, JSON or raw bytes
    ///
    /// # Returns
    /// [`QueueError::CircuitOpen`] while the breaker is open,
    /// [`QueueError::Serialization`] when the message cannot be encoded and
    /// [`QueueError::Publishing`] for any failure of the send itself.
    pub async fn publish(
        &self,
        queue_name: &str,
        message: impl Into<Payload>,
    ) -> Result<(), QueueError> {
        let (body, content_type, message_type) = message.into().encode()?;

        let mut outbound = OutboundMessage {
            body,
            content_type: content_type.to_owned(),
            message_type,
            message_id: Uuid::new_v4().to_string(),
            headers: Default::default(),
        };
        otel::inject(&Context::current(), &mut outbound.headers);

        let declaration = if queue_name == self.definition.name() {
            self.definition.clone()
        } else {
            QueueDefinition::new(queue_name).durable()
        };

        self.breaker
            .call(|| self.send(&declaration, &outbound))
            .await
            .inspect_err(|err| {
                if *err == QueueError::CircuitOpen {
                    warn!(queue = queue_name, "circuit open, message not published");
                }
            })
    }

    async fn send(
        &self,
        declaration: &QueueDefinition,
        message: &OutboundMessage,
    ) -> Result<(), QueueError> {
        let result = match self.pool.get_connection().await {
            Ok(conn) => {
                let result = Self::send_on(conn.as_ref(), declaration, message).await;
                self.pool.release_connection(conn).await;
                result
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                debug!(
                    queue = declaration.name(),
                    message_id = %message.message_id,
                    "message published"
                );
                Ok(())
            }
            Err(err @ QueueError::Publishing(_)) => Err(err),
            Err(err) => {
                error!(queue = declaration.name(), error = err.to_string(), "error publishing message");
                Err(QueueError::Publishing(err.to_string()))
            }
        }
    }

    async fn send_on(
        conn: &dyn BrokerConnection,
        declaration: &QueueDefinition,
        message: &OutboundMessage,
    ) -> Result<(), QueueError> {
        let channel = conn.open_channel(true).await?;

        let result = async {
            channel.declare_queue(declaration).await?;
            channel.publish(declaration.name(), message).await
        }
        .await;

        if let Err(err) = channel.close().await {
            error!(error = err.to_string(), "error closing publisher channel");
        }
        result
    }

    /// Closes the idle connections of the publisher's pool.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerChannel, MockBrokerChannel, MockBrokerConnection, MockConnector};
    use serde_json::json;

    fn pool_with(channel: MockBrokerChannel) -> Arc<ConnectionPool> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            let channel = channel.clone();
            let mut conn = MockBrokerConnection::new();
            conn.expect_is_open().return_const(true);
            conn.expect_open_channel()
                .returning(move |_| Ok(channel.clone()));
            conn.expect_close().returning(|| Ok(()));
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });
        Arc::new(ConnectionPool::new("user_channel", 1, Arc::new(connector)))
    }

    #[tokio::test]
    async fn publishes_json_with_type_and_releases_the_connection() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "user_channel" && def.is_durable())
            .times(1)
            .returning(|_| Ok(0));
        channel
            .expect_publish()
            .withf(|queue, msg| {
                queue == "user_channel"
                    && msg.content_type == JSON_CONTENT_TYPE
                    && msg.message_type.as_deref() == Some("test_message")
                    && !msg.message_id.is_empty()
                    && serde_json::from_slice::<Value>(&msg.body).ok()
                        == Some(json!({"type": "test_message", "content": "hello"}))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let pool = pool_with(channel);
        let publisher = Publisher::new(QueueDefinition::new("user_channel").durable(), pool.clone());

        publisher
            .publish(
                "user_channel",
                json!({"type": "test_message", "content": "hello"}),
            )
            .await
            .unwrap();

        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn plain_text_is_published_as_is() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(0));
        channel
            .expect_publish()
            .withf(|_, msg| {
                msg.content_type == TEXT_CONTENT_TYPE
                    && msg.message_type.is_none()
                    && msg.body == b"hello"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let publisher = Publisher::new(QueueDefinition::new("user_channel"), pool_with(channel));
        publisher.publish("user_channel", "hello").await.unwrap();
    }

    #[tokio::test]
    async fn other_queues_are_declared_plain_durable() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "audit" && def.is_durable() && def.dlq_name().is_none())
            .times(1)
            .returning(|_| Ok(0));
        channel.expect_publish().returning(|_, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let publisher = Publisher::new(
            QueueDefinition::new("user_channel").durable().with_dlq(),
            pool_with(channel),
        );
        publisher.publish("audit", json!({"type": "audit"})).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_open_the_circuit() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(0));
        channel
            .expect_publish()
            .times(5)
            .returning(|_, _| Err(QueueError::Publishing("nack".into())));
        channel.expect_close().returning(|| Ok(()));

        let pool = pool_with(channel);
        let publisher = Publisher::new(QueueDefinition::new("user_channel"), pool.clone());

        for _ in 0..5 {
            let result = publisher.publish("user_channel", json!({"type": "t"})).await;
            assert_eq!(result, Err(QueueError::Publishing("nack".into())));
        }
        assert_eq!(publisher.circuit_state(), CircuitState::Open);
        assert_eq!(pool.idle_count(), 1);

        let result = publisher.publish("user_channel", json!({"type": "t"})).await;
        assert_eq!(result, Err(QueueError::CircuitOpen));
    }

    #[tokio::test]
    async fn connection_failures_are_reported_as_publish_errors() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|| Err(QueueError::Connection("refused".into())));
        let pool = Arc::new(ConnectionPool::new("user_channel", 1, Arc::new(connector)));
        let publisher = Publisher::new(QueueDefinition::new("user_channel"), pool);

        let result = publisher.publish("user_channel", "hello").await;
        assert!(matches!(result, Err(QueueError::Publishing(ref reason)) if reason.contains("refused")));
    }

    #[tokio::test]
    async fn declare_failures_are_reported_as_publish_errors() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Err(QueueError::DeclareQueue(def.name().to_owned())));
        channel.expect_publish().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let pool = pool_with(channel);
        let publisher = Publisher::new(QueueDefinition::new("user_channel"), pool.clone());

        let result = publisher.publish("user_channel", "hello").await;
        assert!(matches!(result, Err(QueueError::Publishing(_))));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn raw_bodies_are_published_byte_for_byte() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(0));
        channel
            .expect_publish()
            .withf(|_, msg| {
                msg.body == [255, 254, 123] && msg.content_type == BINARY_CONTENT_TYPE
            })
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let publisher = Publisher::new(QueueDefinition::new("user_channel"), pool_with(channel));
        publisher
            .publish("user_channel", vec![255u8, 254, 123])
            .await
            .unwrap();
    }
}

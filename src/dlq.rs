// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead Letter Queue Handling
//!
//! A [`DeadLetterHandler`] watches the DLQ of one queue. Every poll interval it reads the
//! DLQ depth and, when messages are waiting, drains them back into the main queue through
//! the [`Publisher`]. A message that cannot be republished is returned to the DLQ with a
//! requeueing nack, never dropped.

use crate::{
    broker::{BrokerChannel, InboundMessage},
    errors::QueueError,
    pool::ConnectionPool,
    publisher::{Payload, Publisher},
    queue::QueueDefinition,
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one drain pass over the DLQ.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Pass {
    requeued: usize,
    failed: bool,
    remaining: u32,
}

pub struct DeadLetterHandler {
    queue: QueueDefinition,
    dlq: QueueDefinition,
    pool: Arc<ConnectionPool>,
    publisher: Arc<Publisher>,
    poll_interval: Duration,
    retry_delay: Duration,
    receive_timeout: Duration,
    stop: watch::Sender<bool>,
}

impl DeadLetterHandler {
    /// Creates the handler of `queue`, which must be configured with a DLQ.
    pub fn new(
        queue: QueueDefinition,
        pool: Arc<ConnectionPool>,
        publisher: Arc<Publisher>,
    ) -> Result<Self, QueueError> {
        let dlq = queue.dlq_definition().ok_or_else(|| {
            QueueError::Config(format!("queue `{}` has no dead letter queue", queue.name()))
        })?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            queue,
            dlq,
            pool,
            publisher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            stop,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn dlq_name(&self) -> &str {
        self.dlq.name()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Ends [`DeadLetterHandler::monitor_dlq`] and any running drain.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Polls the DLQ depth until stopped, draining it whenever it is non-empty.
    pub async fn monitor_dlq(&self) {
        let mut stop = self.stop.subscribe();
        info!(dlq = self.dlq_name(), "dlq monitor started");

        while !self.is_stopped() {
            let wait = match self.depth().await {
                Ok(count) => {
                    info!(dlq = self.dlq_name(), message_count = count, "dlq message count");
                    if count > 0 {
                        let requeued = self.process_dlq().await;
                        debug!(dlq = self.dlq_name(), requeued = requeued, "dlq drained");
                    }
                    self.poll_interval
                }
                Err(err) => {
                    error!(dlq = self.dlq_name(), error = err.to_string(), "error monitoring dlq");
                    self.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.wait_for(|stopped| *stopped) => {}
            }
        }

        info!(dlq = self.dlq_name(), "dlq monitor stopped");
    }

    /// Drains the DLQ into the main queue and returns the number of requeued messages.
    ///
    /// A pass in which a message could not be requeued ends the drain; that message is
    /// back in the DLQ and is picked up by the next poll.
    pub async fn process_dlq(&self) -> usize {
        let mut stop = self.stop.subscribe();
        let mut total = 0;

        while !self.is_stopped() {
            match self.drain_pass().await {
                Ok(pass) => {
                    total += pass.requeued;
                    if pass.failed || pass.remaining == 0 || pass.requeued == 0 {
                        break;
                    }
                }
                Err(err) => {
                    error!(dlq = self.dlq_name(), error = err.to_string(), "error processing dlq");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = stop.wait_for(|stopped| *stopped) => {}
                    }
                }
            }
        }

        total
    }

    /// Republishes `message` to the main queue unchanged, then acknowledges it.
    ///
    /// On failure the message is nacked with requeue, returning it to the DLQ.
    pub async fn requeue_message(&self, message: &InboundMessage) -> Result<(), QueueError> {
        info!(dlq = self.dlq_name(), message = %message.body_lossy(), "processing message from dlq");

        match self
            .publisher
            .publish(self.queue.name(), Payload::Raw(message.body.clone()))
            .await
        {
            Ok(()) => message.acker().ack().await,
            Err(err) => {
                error!(dlq = self.dlq_name(), error = err.to_string(), "error requeueing dlq message");
                message.acker().nack(true).await?;
                Err(err)
            }
        }
    }

    async fn depth(&self) -> Result<u32, QueueError> {
        let conn = self.pool.get_connection().await?;
        let result = async {
            let channel = conn.open_channel(false).await?;
            let count = channel.declare_queue(&self.dlq).await;
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "error closing dlq channel");
            }
            count
        }
        .await;
        self.pool.release_connection(conn).await;
        result
    }

    async fn drain_pass(&self) -> Result<Pass, QueueError> {
        let conn = self.pool.get_connection().await?;
        let result = async {
            let channel = conn.open_channel(false).await?;
            let result = self.drain_channel(channel.as_ref()).await;
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "error closing dlq channel");
            }
            result
        }
        .await;
        self.pool.release_connection(conn).await;
        result
    }

    async fn drain_channel(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<Pass, QueueError> {
        let count = channel.declare_queue(&self.dlq).await?;
        if count == 0 {
            return Ok(Pass::default());
        }

        let tag = format!("{}-{}", self.dlq_name(), Uuid::new_v4());
        let mut deliveries = channel.consume(self.dlq_name(), &tag).await?;
        let mut pass = Pass::default();

        for _ in 0..count {
            if self.is_stopped() {
                break;
            }
            let next = match tokio::time::timeout(self.receive_timeout, deliveries.next()).await {
                Ok(Some(next)) => next?,
                Ok(None) | Err(_) => break,
            };

            match self.requeue_message(&next).await {
                Ok(()) => pass.requeued += 1,
                Err(err @ (QueueError::AckMessage(_) | QueueError::NackMessage(_))) => {
                    return Err(err)
                }
                Err(_) => {
                    pass.failed = true;
                    break;
                }
            }
        }
        drop(deliveries);

        pass.remaining = if pass.failed {
            0
        } else {
            channel.declare_queue(&self.dlq).await?
        };
        if pass.failed {
            warn!(dlq = self.dlq_name(), "dlq drain interrupted, resuming on next poll");
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BrokerChannel, BrokerConnection, MockAcknowledger, MockBrokerChannel,
        MockBrokerConnection, MockConnector,
    };
    use mockall::predicate::eq;

    fn pool_with(channel: Option<MockBrokerChannel>) -> Arc<ConnectionPool> {
        let channel: Option<Arc<dyn BrokerChannel>> =
            channel.map(|c| Arc::new(c) as Arc<dyn BrokerChannel>);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            let Some(channel) = channel.clone() else {
                return Err(QueueError::Connection("refused".into()));
            };
            let mut conn = MockBrokerConnection::new();
            conn.expect_is_open().return_const(true);
            conn.expect_open_channel()
                .returning(move |_| Ok(channel.clone()));
            conn.expect_close().returning(|| Ok(()));
            Ok(Arc::new(conn) as Arc<dyn BrokerConnection>)
        });
        Arc::new(ConnectionPool::new("user_channel", 1, Arc::new(connector)))
    }

    fn dead_letter(acker: MockAcknowledger) -> InboundMessage {
        InboundMessage::new(
            br#"{"type":"test_message","content":"hello"}"#.to_vec(),
            "user_channel_dlq",
            Arc::new(acker),
        )
    }

    fn definition() -> QueueDefinition {
        QueueDefinition::new("user_channel").durable().with_dlq()
    }

    #[test]
    fn requires_a_dead_letter_queue() {
        let pool = pool_with(None);
        let publisher = Arc::new(Publisher::new(QueueDefinition::new("audit"), pool.clone()));

        let result = DeadLetterHandler::new(QueueDefinition::new("audit").durable(), pool, publisher);
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn requeue_republishes_the_body_unchanged_then_acks() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(0));
        channel
            .expect_publish()
            .withf(|queue, msg| {
                queue == "user_channel"
                    && msg.body == br#"{"type":"test_message","content":"hello"}"#.to_vec()
                    && msg.message_type.as_deref() == Some("test_message")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let pool = pool_with(Some(channel));
        let publisher = Arc::new(Publisher::new(definition(), pool.clone()));
        let handler = DeadLetterHandler::new(definition(), pool, publisher).unwrap();

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        handler.requeue_message(&dead_letter(acker)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_requeue_returns_the_message_to_the_dlq() {
        let pool = pool_with(None);
        let publisher = Arc::new(Publisher::new(definition(), pool.clone()));
        let handler = DeadLetterHandler::new(definition(), pool, publisher).unwrap();

        let mut acker = MockAcknowledger::new();
        acker.expect_nack().with(eq(true)).times(1).returning(|_| Ok(()));
        acker.expect_ack().never();

        let result = handler.requeue_message(&dead_letter(acker)).await;
        assert!(matches!(result, Err(QueueError::Publishing(_))));
    }

    #[tokio::test]
    async fn requeue_keeps_non_utf8_bodies_intact() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(0));
        channel
            .expect_publish()
            .withf(|queue, msg| queue == "user_channel" && msg.body == [255, 254, 123])
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let pool = pool_with(Some(channel));
        let publisher = Arc::new(Publisher::new(definition(), pool.clone()));
        let handler = DeadLetterHandler::new(definition(), pool, publisher).unwrap();

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let message = InboundMessage::new(vec![255, 254, 123], "user_channel_dlq", Arc::new(acker));
        handler.requeue_message(&message).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_on_request() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "user_channel_dlq")
            .returning(|_| Ok(0));
        channel.expect_close().returning(|| Ok(()));

        let pool = pool_with(Some(channel));
        let publisher = Arc::new(Publisher::new(definition(), pool.clone()));
        let handler = Arc::new(DeadLetterHandler::new(definition(), pool, publisher).unwrap());
        assert_eq!(handler.dlq_name(), "user_channel_dlq");

        let monitor = handler.clone();
        let task = tokio::spawn(async move { monitor.monitor_dlq().await });
        tokio::time::sleep(Duration::from_secs(120)).await;

        handler.stop();
        task.await.unwrap();
        assert!(handler.is_stopped());
    }
}

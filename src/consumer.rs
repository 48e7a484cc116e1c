// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A [`Consumer`] binds one queue to the handler registry. Its lifecycle is
//! `Stopped -> Running -> Stopped`; a stopped consumer cannot be restarted.
//!
//! While running it leases a connection, opens a channel, declares the queue and
//! iterates the deliveries. Every delivery is decoded as a JSON object carrying a string
//! `type` field and dispatched to the registry. Malformed bodies are rejected without
//! requeue. Transport failures tear the session down and the consumer reconnects after
//! a fixed delay; only [`Consumer::stop_consuming`] ends the loop.

use crate::{
    broker::{BrokerChannel, BrokerConnection, InboundMessage},
    delivery::{DeliveryHandler, DeliveryHandlerFactory, RetryPolicy},
    errors::QueueError,
    otel,
    pool::ConnectionPool,
    queue::QueueDefinition,
    registry::{Dispatch, MessageHandlerRegistry},
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Running,
}

struct Session {
    conn: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

pub struct Consumer {
    definition: QueueDefinition,
    pool: Arc<ConnectionPool>,
    registry: Arc<MessageHandlerRegistry>,
    deliveries: DeliveryHandlerFactory,
    prefetch: u16,
    reconnect_delay: Duration,
    consumer_tag: String,
    running: AtomicBool,
    stop: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
    processing: Mutex<()>,
}

impl Consumer {
    /// Creates a stopped consumer with default prefetch, reconnect delay and retry policy.
    ///
    /// # Parameters
    /// - `definition`: queue to declare and consume from
    /// - `pool`: source of broker connections
    /// - `registry`: handlers the decoded messages are dispatched to
    pub fn new(
        definition: QueueDefinition,
        pool: Arc<ConnectionPool>,
        registry: Arc<MessageHandlerRegistry>,
    ) -> Self {
        Self::with_deliveries(
            definition,
            pool,
            registry,
            DeliveryHandlerFactory::default(),
        )
    }

    fn with_deliveries(
        definition: QueueDefinition,
        pool: Arc<ConnectionPool>,
        registry: Arc<MessageHandlerRegistry>,
        deliveries: DeliveryHandlerFactory,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let consumer_tag = format!("{}-{}", definition.name(), Uuid::new_v4());
        Self {
            definition,
            pool,
            registry,
            deliveries,
            prefetch: DEFAULT_PREFETCH_COUNT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            consumer_tag,
            running: AtomicBool::new(false),
            stop,
            session: Mutex::new(None),
            processing: Mutex::new(()),
        }
    }

    /// Sets how many unacknowledged deliveries the broker may push at once.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the wait between a transport failure and the next connection attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Replaces the retry policy, starting from an empty attempt tracker.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.deliveries = DeliveryHandlerFactory::new(policy);
        self
    }

    /// A fresh consumer on the same queue, sharing pool, registry and retry attempts.
    pub fn replicate(&self) -> Self {
        Self::with_deliveries(
            self.definition.clone(),
            self.pool.clone(),
            self.registry.clone(),
            self.deliveries.clone(),
        )
        .with_prefetch(self.prefetch)
        .with_reconnect_delay(self.reconnect_delay)
    }

    pub fn queue_name(&self) -> &str {
        self.definition.name()
    }

    /// Tag announced to the broker, unique per consumer.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        if self.running.load(Ordering::SeqCst) {
            ConsumerState::Running
        } else {
            ConsumerState::Stopped
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consumes until [`Consumer::stop_consuming`] is called.
    pub async fn start_consuming(&self) -> Result<(), QueueError> {
        if *self.stop.borrow() {
            return Err(QueueError::ConsumerStopped(self.queue_name().to_owned()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(queue = self.queue_name(), "consumer already running");
            return Ok(());
        }

        info!(queue = self.queue_name(), consumer = %self.consumer_tag, "consumer started");
        let mut stop = self.stop.subscribe();

        while self.is_running() {
            if let Err(err) = self.consume(&mut stop).await {
                error!(
                    queue = self.queue_name(),
                    error = err.to_string(),
                    "consumer failure"
                );
            }
            self.teardown().await;

            if !self.is_running() {
                break;
            }

            warn!(
                queue = self.queue_name(),
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "reconnecting consumer"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => {}
            }
        }

        info!(queue = self.queue_name(), consumer = %self.consumer_tag, "consumer stopped");
        Ok(())
    }

    /// Stops the loop, lets an in-flight message finish and closes the session.
    pub async fn stop_consuming(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.send_replace(true);

        let _processing = self.processing.lock().await;
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if session.channel.is_open() {
                if let Err(err) = session.channel.close().await {
                    error!(error = err.to_string(), "error closing consumer channel");
                }
            }
            if session.conn.is_open() {
                if let Err(err) = session.conn.close().await {
                    error!(error = err.to_string(), "error closing consumer connection");
                }
            }
        }
        debug!(queue = self.queue_name(), "stop requested");
    }

    async fn consume(&self, stop: &mut watch::Receiver<bool>) -> Result<(), QueueError> {
        let conn = self.pool.get_connection().await?;
        let channel = match conn.open_channel(false).await {
            Ok(channel) => channel,
            Err(err) => {
                self.pool.release_connection(conn).await;
                return Err(err);
            }
        };
        *self.session.lock().await = Some(Session {
            conn,
            channel: channel.clone(),
        });

        channel.set_prefetch(self.prefetch).await?;
        channel.declare_queue(&self.definition).await?;
        let mut deliveries = channel
            .consume(self.queue_name(), &self.consumer_tag)
            .await?;
        info!(queue = self.queue_name(), "waiting for messages");

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                next = deliveries.next() => next,
            };

            let Some(next) = next else {
                return Err(QueueError::Consume("delivery stream ended".to_owned()));
            };
            let message = next?;

            let _processing = self.processing.lock().await;
            if !self.is_running() {
                message.acker().nack(true).await?;
                return Ok(());
            }
            self.handle(message).await?;
        }
    }

    async fn handle(&self, message: InboundMessage) -> Result<(), QueueError> {
        let delivery = self.deliveries.handler_for(&message);

        let (message_type, body) = match decode(&message.body) {
            Ok(decoded) => decoded,
            Err(err) => {
                let (_ctx, mut span) =
                    otel::new_span(&message.headers, &global::tracer("queue consumer"), self.queue_name());
                warn!(
                    queue = self.queue_name(),
                    error = err.to_string(),
                    message = %message.body_lossy(),
                    "rejecting malformed message"
                );
                otel::record_outcome(&mut span, Err(&err));
                return delivery.nack(false).await;
            }
        };

        let (_ctx, mut span) =
            otel::new_span(&message.headers, &global::tracer("queue consumer"), &message_type);
        debug!(
            queue = self.queue_name(),
            message_type = %message_type,
            redelivered = message.redelivered,
            attempt = delivery.attempt(),
            "received message"
        );

        match self.registry.process(&message_type, &body, &delivery).await {
            Ok(Dispatch::Acked) => otel::record_outcome(&mut span, Ok(())),
            Ok(Dispatch::Rejected) => {
                otel::record_outcome(&mut span, Err(&QueueError::HandlerNotFound(message_type)))
            }
            Ok(Dispatch::Retried) => otel::record_outcome(
                &mut span,
                Err(&QueueError::HandlerExecution(message_type)),
            ),
            Err(err) => {
                otel::record_outcome(&mut span, Err(&err));
                return Err(err);
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        let session = self.session.lock().await.take();
        if let Some(Session { conn, channel }) = session {
            if channel.is_open() {
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "error closing consumer channel");
                }
            }
            self.pool.release_connection(conn).await;
        }
    }
}

/// Parses a body into its `type` field and the JSON document.
fn decode(body: &[u8]) -> Result<(String, Value), QueueError> {
    let value: Value = serde_json::from_slice(body)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| QueueError::Serialization("missing `type` field".to_owned()))?
        .to_owned();
    Ok((message_type, value))
}

/// Workers consuming the same queue, spawned by [`spawn_parallel_consumers`].
pub struct ConsumerGroup {
    consumers: Vec<Arc<Consumer>>,
    tasks: Vec<JoinHandle<Result<(), QueueError>>>,
}

impl ConsumerGroup {
    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Stops every worker and waits for its task to end.
    pub async fn stop(self) {
        for consumer in &self.consumers {
            consumer.stop_consuming().await;
        }
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = err.to_string(), "consumer worker failure"),
                Err(err) => error!(error = err.to_string(), "consumer worker panicked"),
            }
        }
    }
}

/// Spawns `workers` consumers on the queue of `template`, each on its own task.
///
/// Every worker acknowledges independently, so message ordering across workers is
/// not preserved.
pub fn spawn_parallel_consumers(template: &Consumer, workers: usize) -> ConsumerGroup {
    let mut consumers = Vec::with_capacity(workers);
    let mut tasks = Vec::with_capacity(workers);

    for _ in 0..workers.max(1) {
        let consumer = Arc::new(template.replicate());
        let worker = consumer.clone();
        tasks.push(tokio::spawn(async move { worker.start_consuming().await }));
        consumers.push(consumer);
    }

    info!(queue = template.queue_name(), workers = consumers.len(), "consumer workers spawned");
    ConsumerGroup { consumers, tasks }
}

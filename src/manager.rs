// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Manager
//!
//! Wires the configured queues at startup: one connection pool per queue, consumer
//! workers for queues with consumption enabled, a publisher for queues with publishing
//! enabled and a DLQ monitor for publishing queues with a dead letter queue. Queues whose
//! broker type is not supported are skipped, but still show up in the health report.
//!
//! ```no_run
//! use msgqueue::{
//!     config::QueueSettings, errors::HandlerError, manager::QueueManager,
//!     registry::MessageHandlerRegistry,
//! };
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), msgqueue::errors::QueueError> {
//! let settings = QueueSettings::load(None)?;
//! let mut registry = MessageHandlerRegistry::new();
//! registry.add_handler("test_message", |message: &Value| -> Result<(), HandlerError> {
//!     tracing::info!(%message, "received");
//!     Ok(())
//! });
//!
//! let manager = QueueManager::start(settings, registry);
//! manager.publish("user_channel", json!({"type": "test_message"})).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    backend::{default_connector_factory, ConnectorFactory, QueueBackend},
    config::{QueueDescriptor, QueueSettings},
    consumer::{spawn_parallel_consumers, Consumer, ConsumerGroup, DEFAULT_RECONNECT_DELAY},
    delivery::RetryPolicy,
    dlq::{DeadLetterHandler, DEFAULT_POLL_INTERVAL, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETRY_DELAY},
    errors::QueueError,
    health::QueueHealthCheck,
    pool::ConnectionPools,
    publisher::{Payload, Publisher},
    queue::QueueDefinition,
    registry::MessageHandlerRegistry,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Timing knobs applied to every queue the manager starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerOptions {
    pub retry_policy: RetryPolicy,
    pub reconnect_delay: Duration,
    pub dlq_poll_interval: Duration,
    pub dlq_retry_delay: Duration,
    pub dlq_receive_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            dlq_poll_interval: DEFAULT_POLL_INTERVAL,
            dlq_retry_delay: DEFAULT_RETRY_DELAY,
            dlq_receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

pub struct QueueManagerBuilder {
    settings: QueueSettings,
    registry: Arc<MessageHandlerRegistry>,
    pools: Arc<ConnectionPools>,
    connectors: ConnectorFactory,
    options: ManagerOptions,
}

impl QueueManagerBuilder {
    /// Shares an existing pool registry instead of creating a fresh one.
    pub fn pools(mut self, pools: Arc<ConnectionPools>) -> Self {
        self.pools = pools;
        self
    }

    pub fn connectors(mut self, connectors: ConnectorFactory) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts every configured queue. Must be called within a tokio runtime.
    pub fn start(self) -> QueueManager {
        let mut manager = QueueManager {
            configured: self.settings.queues.clone(),
            descriptors: Vec::new(),
            pools: self.pools,
            connectors: self.connectors,
            publishers: HashMap::new(),
            consumers: HashMap::new(),
            dlq_monitors: HashMap::new(),
        };

        for descriptor in self.settings.queues {
            if let Err(err) = manager.setup(&descriptor, &self.registry, &self.options) {
                match err {
                    QueueError::UnsupportedQueueType(_) => {
                        warn!(queue = %descriptor.name, error = err.to_string(), "skipping queue")
                    }
                    _ => error!(queue = %descriptor.name, error = err.to_string(), "failure to set up queue"),
                }
                continue;
            }
            manager.descriptors.push(descriptor);
        }

        info!(queues = manager.descriptors.len(), "queue manager started");
        manager
    }
}

struct DlqMonitor {
    handler: Arc<DeadLetterHandler>,
    task: JoinHandle<()>,
}

pub struct QueueManager {
    configured: Vec<QueueDescriptor>,
    descriptors: Vec<QueueDescriptor>,
    pools: Arc<ConnectionPools>,
    connectors: ConnectorFactory,
    publishers: HashMap<String, Arc<Publisher>>,
    consumers: HashMap<String, ConsumerGroup>,
    dlq_monitors: HashMap<String, DlqMonitor>,
}

impl QueueManager {
    pub fn builder(settings: QueueSettings, registry: MessageHandlerRegistry) -> QueueManagerBuilder {
        QueueManagerBuilder {
            settings,
            registry: Arc::new(registry),
            pools: Arc::new(ConnectionPools::new()),
            connectors: default_connector_factory(),
            options: ManagerOptions::default(),
        }
    }

    /// Starts every configured queue against the real brokers with default options.
    pub fn start(settings: QueueSettings, registry: MessageHandlerRegistry) -> Self {
        Self::builder(settings, registry).start()
    }

    fn setup(
        &mut self,
        descriptor: &QueueDescriptor,
        registry: &Arc<MessageHandlerRegistry>,
        options: &ManagerOptions,
    ) -> Result<(), QueueError> {
        let backend = QueueBackend::for_descriptor(descriptor)?;
        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
            return Err(QueueError::Config(format!(
                "queue `{}` is configured twice",
                descriptor.name
            )));
        }

        let connector = (self.connectors)(backend, descriptor)?;
        let pool = self
            .pools
            .get_or_create(&descriptor.name, descriptor.max_pool_size, || connector);
        let definition = QueueDefinition::from_descriptor(descriptor);
        info!(queue = %descriptor.name, backend = %backend, "setting up queue");

        if descriptor.enable_consumer {
            let template = Consumer::new(definition.clone(), pool.clone(), registry.clone())
                .with_prefetch(descriptor.prefetch_count)
                .with_reconnect_delay(options.reconnect_delay)
                .with_retry_policy(options.retry_policy);
            let group = spawn_parallel_consumers(&template, descriptor.consumer_workers);
            self.consumers.insert(descriptor.name.clone(), group);
        }

        if descriptor.enable_publisher {
            let publisher = Arc::new(Publisher::new(definition.clone(), pool.clone()));
            self.publishers
                .insert(descriptor.name.clone(), publisher.clone());
            info!(queue = %descriptor.name, "publisher ready");

            if descriptor.enable_dlq {
                let handler = Arc::new(
                    DeadLetterHandler::new(definition, pool, publisher)?
                        .with_poll_interval(options.dlq_poll_interval)
                        .with_retry_delay(options.dlq_retry_delay)
                        .with_receive_timeout(options.dlq_receive_timeout),
                );
                let monitor = handler.clone();
                let task = tokio::spawn(async move { monitor.monitor_dlq().await });
                self.dlq_monitors
                    .insert(descriptor.name.clone(), DlqMonitor { handler, task });
            }
        } else if descriptor.enable_dlq {
            warn!(queue = %descriptor.name, "dlq monitoring requires publishing to be enabled");
        }

        Ok(())
    }

    /// Publishes `message` through the publisher of `queue_name`.
    pub async fn publish(
        &self,
        queue_name: &str,
        message: impl Into<Payload>,
    ) -> Result<(), QueueError> {
        let publisher = self
            .publishers
            .get(queue_name)
            .ok_or_else(|| QueueError::PublisherNotFound(queue_name.to_owned()))?;
        publisher.publish(queue_name, message).await
    }

    pub fn publisher(&self, queue_name: &str) -> Option<Arc<Publisher>> {
        self.publishers.get(queue_name).cloned()
    }

    pub fn consumers(&self, queue_name: &str) -> Option<&[Arc<Consumer>]> {
        self.consumers.get(queue_name).map(ConsumerGroup::consumers)
    }

    pub fn dlq_handler(&self, queue_name: &str) -> Option<Arc<DeadLetterHandler>> {
        self.dlq_monitors
            .get(queue_name)
            .map(|monitor| monitor.handler.clone())
    }

    /// Names of the queues that were set up.
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    /// Health check over every configured queue, including the ones that failed setup.
    pub fn health_check(&self) -> QueueHealthCheck {
        QueueHealthCheck::with_connectors(self.configured.clone(), self.connectors.clone())
    }

    /// Stops consumers and DLQ monitors, then closes every pooled connection.
    pub async fn shutdown(self) {
        info!("shutting down queue manager");

        for (_, group) in self.consumers {
            group.stop().await;
        }

        for (name, monitor) in self.dlq_monitors {
            monitor.handler.stop();
            if let Err(err) = monitor.task.await {
                error!(queue = %name, error = err.to_string(), "dlq monitor task failure");
            }
        }

        for publisher in self.publishers.values() {
            publisher.close().await;
        }
        self.pools.close_all().await;

        info!("queue manager stopped");
    }
}

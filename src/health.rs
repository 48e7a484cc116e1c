// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Health Check
//!
//! Opens a fresh connection to the broker of every configured queue and reports
//! whether it came up open. The aggregate status is unhealthy as soon as one queue is.

use crate::{
    backend::{default_connector_factory, ConnectorFactory, QueueBackend},
    config::QueueDescriptor,
    errors::QueueError,
};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{error, warn};

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub const STATUS_OK: u16 = 200;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueHealth {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queues: BTreeMap<String, QueueHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// HTTP status code of the report: 200 when every queue is healthy, else 503.
    pub fn status_code(&self) -> u16 {
        if self.is_healthy() {
            STATUS_OK
        } else {
            STATUS_SERVICE_UNAVAILABLE
        }
    }
}

pub struct QueueHealthCheck {
    descriptors: Vec<QueueDescriptor>,
    connectors: ConnectorFactory,
    timeout: Duration,
}

impl QueueHealthCheck {
    pub fn new(descriptors: Vec<QueueDescriptor>) -> Self {
        Self::with_connectors(descriptors, default_connector_factory())
    }

    pub fn with_connectors(descriptors: Vec<QueueDescriptor>, connectors: ConnectorFactory) -> Self {
        Self {
            descriptors,
            connectors,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check_health(&self) -> HealthReport {
        let mut queues = BTreeMap::new();
        for descriptor in &self.descriptors {
            let health = match self.check_queue(descriptor).await {
                Ok(()) => QueueHealth::healthy(),
                Err(err) => {
                    error!(
                        queue = %descriptor.name,
                        error = err.to_string(),
                        "error checking queue health"
                    );
                    QueueHealth::unhealthy(err.to_string())
                }
            };
            queues.insert(descriptor.name.clone(), health);
        }

        let status = if queues
            .values()
            .all(|queue| queue.status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, queues }
    }

    async fn check_queue(&self, descriptor: &QueueDescriptor) -> Result<(), QueueError> {
        let backend = QueueBackend::for_descriptor(descriptor)?;
        let connector = (self.connectors)(backend, descriptor)?;

        let conn = tokio::time::timeout(self.timeout, connector.connect())
            .await
            .map_err(|_| QueueError::Connection("timed out opening connection".to_owned()))??;

        let open = conn.is_open();
        if let Err(err) = conn.close().await {
            warn!(queue = %descriptor.name, error = err.to_string(), "error closing health check connection");
        }

        if open {
            Ok(())
        } else {
            Err(QueueError::Connection("connection is not open".to_owned()))
        }
    }
}

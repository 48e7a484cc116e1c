// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Pooling
//!
//! One [`ConnectionPool`] exists per queue name, handed out by the [`ConnectionPools`]
//! registry. A pool pre-warms up to its maximum size on first use, lends idle
//! connections, replaces connections found closed, and grows past its maximum when
//! every connection is leased. Connections returned while the idle set is full are
//! closed, so the idle set never exceeds the maximum.

use crate::{
    broker::{BrokerConnection, Connector},
    errors::QueueError,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Idle connections of one queue. Leased connections are owned by the borrower
/// until they are released.
pub struct ConnectionPool {
    queue_name: String,
    connector: Arc<dyn Connector>,
    max_size: usize,
    idle: Mutex<VecDeque<Arc<dyn BrokerConnection>>>,
    warmed: OnceCell<()>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened on first use.
    ///
    /// # Parameters
    /// - `queue_name`: queue the pool serves, used in logs
    /// - `max_size`: idle connections kept, at least one
    /// - `connector`: opens new broker connections
    pub fn new(queue_name: &str, max_size: usize, connector: Arc<dyn Connector>) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            connector,
            max_size: max_size.max(1),
            idle: Mutex::new(VecDeque::new()),
            warmed: OnceCell::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Connections currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Opens up to `max_size` connections. Runs once; later calls return immediately.
    pub async fn initialize(&self) {
        self.warmed
            .get_or_init(|| async {
                let mut created = 0;
                for _ in 0..self.max_size {
                    match self.connector.connect().await {
                        Ok(conn) => {
                            self.idle.lock().push_back(conn);
                            created += 1;
                        }
                        Err(err) => {
                            warn!(
                                queue = %self.queue_name,
                                error = err.to_string(),
                                "failure to pre-warm connection pool"
                            );
                            break;
                        }
                    }
                }
                info!(queue = %self.queue_name, connections = created, "connection pool initialized");
            })
            .await;
    }

    /// Lends a connection, creating one when the idle set is empty or holds a closed one.
    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.initialize().await;

        let next = self.idle.lock().pop_front();
        match next {
            Some(conn) if conn.is_open() => Ok(conn),
            Some(_) => {
                warn!(queue = %self.queue_name, "connection is closed, creating a new connection");
                self.create().await
            }
            None => {
                warn!(queue = %self.queue_name, "connection pool is empty, creating a new connection");
                self.create().await
            }
        }
    }

    /// Takes back a leased connection.
    ///
    /// Closed connections are dropped and connections beyond `max_size` are closed.
    pub async fn release_connection(&self, conn: Arc<dyn BrokerConnection>) {
        if !conn.is_open() {
            debug!(queue = %self.queue_name, "dropping closed connection");
            return;
        }

        let surplus = {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_size {
                idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = surplus {
            debug!(queue = %self.queue_name, "pool is full, closing surplus connection");
            if let Err(err) = conn.close().await {
                error!(error = err.to_string(), "error while releasing connection");
            }
        }
    }

    /// Closes every idle connection. Leased connections are not waited for.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for conn in drained {
            if let Err(err) = conn.close().await {
                error!(error = err.to_string(), "error closing connection");
            }
        }
        debug!(queue = %self.queue_name, "connection pool closed");
    }

    async fn create(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.connector.connect().await.map_err(|err| {
            error!(queue = %self.queue_name, error = err.to_string(), "failed to create new connection");
            match err {
                QueueError::Connection(_) => err,
                other => QueueError::Connection(other.to_string()),
            }
        })
    }
}

/// Registry holding one pool per queue name for the lifetime of the process.
#[derive(Default)]
pub struct ConnectionPools {
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl ConnectionPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool of `queue_name`, creating it with `connector` on first request.
    pub fn get_or_create<F>(
        &self,
        queue_name: &str,
        max_size: usize,
        connector: F,
    ) -> Arc<ConnectionPool>
    where
        F: FnOnce() -> Arc<dyn Connector>,
    {
        let mut pools = self.pools.lock();
        pools
            .entry(queue_name.to_owned())
            .or_insert_with(|| Arc::new(ConnectionPool::new(queue_name, max_size, connector())))
            .clone()
    }

    /// The pool of `queue_name`, if one was created.
    pub fn get(&self, queue_name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.lock().get(queue_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Tears down every pool.
    pub async fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close_all().await;
        }
    }
}

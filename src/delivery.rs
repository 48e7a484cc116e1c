// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Delivery Handling
//!
//! This module wraps one in-flight message with the acknowledge, negative-acknowledge
//! and retry-with-backoff operations. Retry keeps the message on the broker: the
//! handler sleeps for the backoff of the current attempt and then nacks with requeue.
//! Once `max_retries` attempts are spent the message is nacked without requeue and
//! the broker routes it to the dead-letter queue.
//!
//! Broker redelivery carries no attempt count, so the [`DeliveryHandlerFactory`] of
//! each consumer remembers in memory how often a message was retried, keyed by its
//! message id (or a hash of its body when no id was set). Entries expire after a
//! quiet period and the tracker holds a bounded number of them, so messages that are
//! settled by another process never pin memory here.

use crate::{
    broker::{Acknowledger, InboundMessage},
    errors::QueueError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_JITTER: f64 = 0.1;
pub const DEFAULT_TRACKER_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_TRACKER_CAPACITY: usize = 10_000;

/// Exponential backoff policy for handler failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Relative spread applied around the backoff, `0.0` disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// `initial_backoff * 2^attempt`, saturating.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// The backoff of `attempt` spread by a random factor in `[1 - jitter, 1 + jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    pub fn retries_left(&self, attempt: u32) -> u32 {
        self.max_retries.saturating_sub(attempt.saturating_add(1))
    }
}

/// In-memory attempt counts of messages currently being retried.
///
/// An entry not touched for `ttl` reads as a fresh message. When `capacity` entries
/// are held, expired entries are purged first and then the least recently touched one
/// is evicted.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    attempts: Arc<Mutex<HashMap<String, TrackedAttempt>>>,
    ttl: Duration,
    capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct TrackedAttempt {
    attempt: u32,
    touched: Instant,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_TTL, DEFAULT_TRACKER_CAPACITY)
    }
}

impl RetryTracker {
    /// Creates an empty tracker.
    ///
    /// # Parameters
    /// - `ttl`: how long an entry survives without being recorded again
    /// - `capacity`: maximum number of entries held, at least one
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Attempts already spent on `key`, `0` when unknown or expired.
    pub fn attempt(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock();
        match attempts.get(key) {
            Some(entry) if entry.touched.elapsed() < self.ttl => entry.attempt,
            Some(_) => {
                attempts.remove(key);
                0
            }
            None => 0,
        }
    }

    /// Stores `attempt` for `key`, evicting entries when the tracker is full.
    pub fn record(&self, key: &str, attempt: u32) {
        let mut attempts = self.attempts.lock();
        if !attempts.contains_key(key) && attempts.len() >= self.capacity {
            let ttl = self.ttl;
            attempts.retain(|_, entry| entry.touched.elapsed() < ttl);

            if attempts.len() >= self.capacity {
                let oldest = attempts
                    .iter()
                    .min_by_key(|(_, entry)| entry.touched)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    warn!(key = %oldest, "retry tracker full, evicting oldest entry");
                    attempts.remove(&oldest);
                }
            }
        }

        attempts.insert(
            key.to_owned(),
            TrackedAttempt {
                attempt,
                touched: Instant::now(),
            },
        );
    }

    pub fn forget(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.lock().is_empty()
    }
}

/// Settles one inbound message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Number of retries already spent on this message.
    fn attempt(&self) -> u32;

    async fn ack(&self) -> Result<(), QueueError>;

    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;

    async fn retry(&self, attempt: u32) -> Result<(), QueueError>;
}

pub struct MessageDeliveryHandler {
    acker: Arc<dyn Acknowledger>,
    routing_key: String,
    body: String,
    policy: RetryPolicy,
    attempt: u32,
    tracking: Option<(RetryTracker, String)>,
}

impl MessageDeliveryHandler {
    /// Creates an untracked handler starting at attempt zero.
    ///
    /// # Parameters
    /// - `message`: the delivery to settle
    /// - `policy`: backoff and retry limit
    pub fn new(message: &InboundMessage, policy: RetryPolicy) -> Self {
        Self {
            acker: message.acker(),
            routing_key: message.routing_key.clone(),
            body: message.body_lossy(),
            policy,
            attempt: 0,
            tracking: None,
        }
    }

    /// Binds the handler to an attempt tracker, starting from the recorded attempt.
    pub fn tracked(mut self, tracker: RetryTracker, key: String) -> Self {
        self.attempt = tracker.attempt(&key);
        self.tracking = Some((tracker, key));
        self
    }

    fn forget(&self) {
        if let Some((tracker, key)) = &self.tracking {
            tracker.forget(key);
        }
    }

    fn record(&self, attempt: u32) {
        if let Some((tracker, key)) = &self.tracking {
            tracker.record(key, attempt);
        }
    }
}

#[async_trait]
impl DeliveryHandler for MessageDeliveryHandler {
    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.acker.ack().await?;
        self.forget();
        info!(
            action = "message_processed",
            queue = %self.routing_key,
            message = %self.body,
        );
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker.nack(requeue).await?;
        if !requeue {
            self.forget();
        }
        info!(
            action = "message_rejected",
            queue = %self.routing_key,
            requeue = requeue,
            message = %self.body,
        );
        Ok(())
    }

    async fn retry(&self, attempt: u32) -> Result<(), QueueError> {
        if attempt < self.policy.max_retries {
            let backoff = self.policy.delay_for(attempt);
            tokio::time::sleep(backoff).await;

            self.acker.nack(true).await?;
            self.record(attempt + 1);
            warn!(
                action = "message_retry",
                queue = %self.routing_key,
                backoff_ms = backoff.as_millis() as u64,
                retries_left = self.policy.retries_left(attempt),
                "retrying message"
            );
            return Ok(());
        }

        self.acker.nack(false).await?;
        self.forget();
        error!(
            action = "message_dlq",
            queue = %self.routing_key,
            message = %self.body,
            "message moved to dead letter queue after max retries"
        );
        Ok(())
    }
}

/// Creates delivery handlers sharing one retry policy and attempt tracker.
#[derive(Debug, Clone, Default)]
pub struct DeliveryHandlerFactory {
    policy: RetryPolicy,
    tracker: RetryTracker,
}

impl DeliveryHandlerFactory {
    /// Creates a factory with a fresh tracker bounded by the default TTL and capacity.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_tracker(policy, RetryTracker::default())
    }

    /// Creates a factory sharing `tracker`.
    ///
    /// # Parameters
    /// - `policy`: retry policy applied to every handler
    /// - `tracker`: attempt store, shared by clones of the factory
    pub fn with_tracker(policy: RetryPolicy, tracker: RetryTracker) -> Self {
        Self { policy, tracker }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn tracker(&self) -> &RetryTracker {
        &self.tracker
    }

    /// Wraps `message` in a handler that resumes from its recorded attempt.
    pub fn handler_for(&self, message: &InboundMessage) -> MessageDeliveryHandler {
        MessageDeliveryHandler::new(message, self.policy)
            .tracked(self.tracker.clone(), tracking_key(message))
    }
}

fn tracking_key(message: &InboundMessage) -> String {
    match &message.message_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => {
            let mut hasher = DefaultHasher::new();
            message.routing_key.hash(&mut hasher);
            message.body.hash(&mut hasher);
            format!("body:{:016x}", hasher.finish())
        }
    }
}

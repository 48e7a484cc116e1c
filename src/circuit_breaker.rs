// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Circuit Breaker
//!
//! Guards the publisher's network call. After `failure_threshold` consecutive failures
//! the breaker opens and every call fails with [`QueueError::CircuitOpen`] without
//! running the operation. Once `recovery_timeout` has elapsed a single trial call is
//! let through: success closes the breaker, failure reopens it for another window.
//! A trial that is dropped before it completes counts as a failed trial.

use crate::errors::QueueError;
use parking_lot::Mutex;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str) -> Self {
        Self::with_policy(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }

    pub fn with_policy(name: &str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }

    /// Runs `operation` unless the breaker is open.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut trial = TrialGuard {
            breaker: self,
            armed: self.acquire()?,
        };

        let result = operation().await;
        trial.armed = false;
        match &result {
            Ok(_) => self.on_success(),
            Err(err) => self.on_failure(err),
        }
        result
    }

    /// Returns `true` when the admitted call is the half-open trial.
    fn acquire(&self) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        match *state {
            Inner::Closed { .. } => Ok(false),
            Inner::Open { since } if since.elapsed() >= self.recovery_timeout => {
                info!(breaker = %self.name, "recovery window elapsed, allowing a trial call");
                *state = Inner::HalfOpen;
                Ok(true)
            }
            // a trial call is already in flight
            Inner::Open { .. } | Inner::HalfOpen => Err(QueueError::CircuitOpen),
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if matches!(*state, Inner::HalfOpen) {
            info!(breaker = %self.name, "trial call succeeded, closing circuit");
        }
        *state = Inner::Closed { failures: 0 };
    }

    fn on_failure(&self, err: &QueueError) {
        let mut state = self.state.lock();
        match *state {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = failures,
                        error = err.to_string(),
                        "failure threshold reached, opening circuit"
                    );
                    *state = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen => {
                warn!(breaker = %self.name, error = err.to_string(), "trial call failed, reopening circuit");
                *state = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    fn on_abandoned_trial(&self) {
        let mut state = self.state.lock();
        if matches!(*state, Inner::HalfOpen) {
            warn!(breaker = %self.name, "trial call cancelled, reopening circuit");
            *state = Inner::Open {
                since: Instant::now(),
            };
        }
    }
}

/// Reopens the breaker if the trial future is dropped before it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_abandoned_trial();
        }
    }
}

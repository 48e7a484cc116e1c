// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker-agnostic message queue subsystem with an AMQP backend: pooled connections,
//! a circuit-breaking publisher, self-healing consumers dispatching to registered
//! handlers, retry with exponential backoff and dead letter queue draining.

pub mod amqp;
pub mod backend;
pub mod broker;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dlq;
pub mod errors;
pub mod health;
pub mod logging;
pub mod manager;
pub mod otel;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod registry;

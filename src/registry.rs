// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handler Registry
//!
//! Maps a message type to the handler that processes it. [`MessageHandlerRegistry::process`]
//! is the single dispatch point of the crate: the consumer hands it the decoded body and
//! the delivery handler, and the registry settles the message by the handler's outcome.

use crate::{
    delivery::DeliveryHandler,
    errors::{HandlerError, QueueError},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, warn};

/// Business logic for one message type.
///
/// Returning `Err` sends the message through the retry protocol. Plain closures
/// `Fn(&Value) -> Result<(), HandlerError>` implement this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, message: &Value) -> Result<(), HandlerError> {
        self(message)
    }
}

/// How [`MessageHandlerRegistry::process`] settled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Acked,
    Retried,
    Rejected,
}

#[derive(Default, Clone)]
pub struct MessageHandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl MessageHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler of `message_type`, replacing any previous one.
    pub fn add_handler<H>(&mut self, message_type: &str, handler: H) -> &mut Self
    where
        H: MessageHandler + 'static,
    {
        if self
            .handlers
            .insert(message_type.to_owned(), Arc::new(handler))
            .is_some()
        {
            debug!(message_type = message_type, "handler replaced");
        }
        self
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler of `message_type` and settles the delivery.
    ///
    /// Errors are only returned when settling the delivery fails.
    pub async fn process(
        &self,
        message_type: &str,
        message: &Value,
        delivery: &dyn DeliveryHandler,
    ) -> Result<Dispatch, QueueError> {
        let Some(handler) = self.handlers.get(message_type) else {
            let err = QueueError::HandlerNotFound(message_type.to_owned());
            warn!(
                message_type = message_type,
                error = err.to_string(),
                "unroutable message, rejecting"
            );
            delivery.nack(false).await?;
            return Ok(Dispatch::Rejected);
        };

        match handler.handle(message).await {
            Ok(()) => {
                delivery.ack().await?;
                Ok(Dispatch::Acked)
            }
            Err(err) => {
                let err = QueueError::HandlerExecution(err.to_string());
                warn!(
                    message_type = message_type,
                    attempt = delivery.attempt(),
                    error = err.to_string(),
                    "handler failed"
                );
                delivery.retry(delivery.attempt()).await?;
                Ok(Dispatch::Retried)
            }
        }
    }
}

impl fmt::Debug for MessageHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("MessageHandlerRegistry")
            .field("message_types", &types)
            .finish()
    }
}

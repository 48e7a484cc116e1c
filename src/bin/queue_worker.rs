// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use msgqueue::{
    config::QueueSettings,
    errors::{HandlerError, QueueError},
    logging::init_logging,
    manager::QueueManager,
    registry::MessageHandlerRegistry,
};
use serde_json::Value;
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

fn test_message(message: &Value) -> Result<(), HandlerError> {
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    info!(action = "test_message", content = content, "handled test message");
    Ok(())
}

async fn run() -> Result<(), QueueError> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let settings = QueueSettings::load(path.as_deref())?;

    let mut registry = MessageHandlerRegistry::new();
    registry.add_handler("test_message", test_message);

    let manager = QueueManager::start(settings, registry);

    let report = manager.health_check().check_health().await;
    match serde_json::to_string(&report) {
        Ok(json) => info!(status_code = report.status_code(), report = %json, "queue health"),
        Err(err) => error!(error = err.to_string(), "failure to encode health report"),
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for shutdown signal");
    }

    manager.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging("queue-worker");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "queue worker failure");
            ExitCode::FAILURE
        }
    }
}

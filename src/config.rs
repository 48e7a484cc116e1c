// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! Queue descriptors are loaded once at startup from a YAML document and shared
//! read-only afterwards. Secrets never live in the file: the descriptor only names
//! the environment variables holding the broker credentials.
//!
//! ```yaml
//! queues:
//!   - name: user_channel
//!     type: rabbitmq
//!     broker_url: localhost
//!     port: 5672
//!     enable_dlq: true
//! ```

use crate::errors::QueueError;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Environment variable pointing at the queue configuration file
pub const QUEUE_CONFIG_ENV: &str = "QUEUE_CONFIG";
/// Path searched when no explicit configuration file is given
pub const DEFAULT_CONFIG_PATH: &str = "config/queues.yaml";

const DEFAULT_USERNAME_ENV: &str = "QUEUE_USERNAME";
const DEFAULT_PASSWORD_ENV: &str = "QUEUE_PASSWORD";
const FALLBACK_CREDENTIAL: &str = "guest";

/// Configuration of every queue handled by the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub queues: Vec<QueueDescriptor>,
}

/// One configured queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    /// Broker type, resolved into a [`crate::backend::QueueBackend`] at setup.
    #[serde(rename = "type")]
    pub broker: String,
    #[serde(default = "default_host")]
    pub broker_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub credentials: CredentialsRef,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    /// Number of consumers bound to this queue. More than one relaxes ordering.
    #[serde(default = "default_workers")]
    pub consumer_workers: usize,
    #[serde(default = "default_true")]
    pub enable_publisher: bool,
    #[serde(default = "default_true")]
    pub enable_consumer: bool,
    #[serde(default)]
    pub enable_dlq: bool,
}

/// Names of the environment variables holding the broker credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsRef {
    pub username_env: String,
    pub password_env: String,
}

impl Default for CredentialsRef {
    fn default() -> Self {
        Self {
            username_env: DEFAULT_USERNAME_ENV.to_owned(),
            password_env: DEFAULT_PASSWORD_ENV.to_owned(),
        }
    }
}

impl CredentialsRef {
    /// Resolves `(username, password)` from the environment, falling back to `guest`.
    pub fn resolve(&self) -> (String, String) {
        let user = env::var(&self.username_env).unwrap_or_else(|_| FALLBACK_CREDENTIAL.to_owned());
        let password =
            env::var(&self.password_env).unwrap_or_else(|_| FALLBACK_CREDENTIAL.to_owned());
        (user, password)
    }
}

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// PEM bundle of trusted CA certificates
    pub ca_certs: Option<PathBuf>,
    /// PKCS#12 client identity
    pub identity: Option<PathBuf>,
    pub identity_password: Option<String>,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_heartbeat() -> u16 {
    60
}

fn default_pool_size() -> usize {
    10
}

fn default_prefetch() -> u16 {
    10
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl QueueDescriptor {
    /// Creates a descriptor with default settings for the given queue and broker type.
    pub fn new(name: &str, broker: &str) -> Self {
        Self {
            name: name.to_owned(),
            broker: broker.to_owned(),
            broker_url: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            credentials: CredentialsRef::default(),
            tls: None,
            heartbeat: default_heartbeat(),
            max_pool_size: default_pool_size(),
            prefetch_count: default_prefetch(),
            consumer_workers: default_workers(),
            enable_publisher: true,
            enable_consumer: true,
            enable_dlq: false,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|tls| tls.enabled).unwrap_or(false)
    }

    fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Config("queue name must not be empty".to_owned()));
        }
        if self.max_pool_size == 0 {
            return Err(QueueError::Config(format!(
                "queue `{}`: max_pool_size must be at least 1",
                self.name
            )));
        }
        if self.consumer_workers == 0 {
            return Err(QueueError::Config(format!(
                "queue `{}`: consumer_workers must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

impl QueueSettings {
    /// Parses settings from a YAML document. An empty document yields no queues.
    pub fn from_yaml(content: &str) -> Result<Self, QueueError> {
        if content.trim().is_empty() {
            return Ok(QueueSettings::default());
        }

        let settings: QueueSettings =
            serde_yaml::from_str(content).map_err(|err| QueueError::Config(err.to_string()))?;

        for queue in &settings.queues {
            queue.validate()?;
        }

        Ok(settings)
    }

    /// Loads settings from `path`. A missing or empty file yields no queues.
    pub fn from_file(path: &Path) -> Result<Self, QueueError> {
        if !path.exists() {
            info!(
                path = %path.display(),
                "configuration file not found, no queues will be configured"
            );
            return Ok(QueueSettings::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|err| QueueError::Config(format!("{}: {}", path.display(), err)))?;

        let settings = Self::from_yaml(&content)?;
        if settings.queues.is_empty() {
            info!(path = %path.display(), "configuration file is empty, no queues will be configured");
        } else {
            info!(
                path = %path.display(),
                queues = settings.queues.len(),
                "loaded queue configuration"
            );
        }

        Ok(settings)
    }

    /// Loads settings from the explicit path, then `QUEUE_CONFIG`, then the default path.
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => env::var(QUEUE_CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        debug!(path = %path.display(), "loading queue configuration");
        Self::from_file(&path)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDescriptor> {
        self.queues.iter().find(|q| q.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_descriptors_with_defaults() {
        let yaml = r#"
queues:
  - name: user_channel
    type: rabbitmq
    broker_url: rabbit.internal
    enable_dlq: true
  - name: audit
    type: rabbitmq
    port: 5671
    enable_consumer: false
    tls:
      enabled: true
      ca_certs: /etc/ssl/ca.pem
"#;
        let settings = QueueSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.queues.len(), 2);

        let user = settings.queue("user_channel").unwrap();
        assert_eq!(user.broker, "rabbitmq");
        assert_eq!(user.broker_url, "rabbit.internal");
        assert_eq!(user.port, 5672);
        assert_eq!(user.vhost, "/");
        assert_eq!(user.heartbeat, 60);
        assert_eq!(user.max_pool_size, 10);
        assert!(user.enable_publisher && user.enable_consumer && user.enable_dlq);
        assert!(!user.tls_enabled());

        let audit = settings.queue("audit").unwrap();
        assert_eq!(audit.port, 5671);
        assert!(!audit.enable_consumer);
        assert!(audit.tls_enabled());
        assert_eq!(audit.credentials, CredentialsRef::default());
    }

    #[test]
    fn empty_document_has_no_queues() {
        assert!(QueueSettings::from_yaml("   \n").unwrap().queues.is_empty());
    }

    #[test]
    fn missing_file_has_no_queues() {
        let settings = QueueSettings::from_file(Path::new("/nonexistent/queues.yaml")).unwrap();
        assert!(settings.queues.is_empty());
    }

    #[test]
    fn rejects_zero_pool_size() {
        let yaml = "queues:\n  - name: q\n    type: rabbitmq\n    max_pool_size: 0\n";
        assert!(matches!(
            QueueSettings::from_yaml(yaml),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            QueueSettings::from_yaml("queues: [ {name: }"),
            Err(QueueError::Config(_))
        ));
    }
}

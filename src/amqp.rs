// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Backend
//!
//! This module implements the broker traits on top of `lapin`. It handles the creation
//! of AMQP connections (plain or TLS) and channels, queue declaration with dead-letter
//! arguments, confirmed publishing and the mapping of lapin deliveries into
//! [`InboundMessage`]s.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, Connector, DeliveryStream, Headers,
        InboundMessage, OutboundMessage,
    },
    config::QueueDescriptor,
    errors::QueueError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, fs, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections for one configured queue.
pub struct AmqpConnector {
    uri: AMQPUri,
    connection_name: String,
    tls: Option<TlsMaterial>,
}

/// TLS material read once at construction, turned into a lapin config on every connect.
struct TlsMaterial {
    cert_chain: Option<String>,
    identity: Option<(Vec<u8>, String)>,
}

impl TlsMaterial {
    fn to_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self.identity.as_ref().map(|(der, password)| OwnedIdentity {
                der: der.clone(),
                password: password.clone(),
            }),
            cert_chain: self.cert_chain.clone(),
        }
    }
}

impl AmqpConnector {
    /// Builds a connector from a queue descriptor.
    ///
    /// Credentials are resolved from the environment here, TLS material is read from disk.
    /// The URI is assembled field by field so credentials never need escaping.
    pub fn new(descriptor: &QueueDescriptor) -> Result<Self, QueueError> {
        let (username, password) = descriptor.credentials.resolve();
        let scheme = if descriptor.tls_enabled() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        };

        let uri = AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo { username, password },
                host: descriptor.broker_url.clone(),
                port: descriptor.port,
            },
            vhost: vhost_name(&descriptor.vhost),
            query: AMQPQueryString {
                heartbeat: Some(descriptor.heartbeat),
                ..Default::default()
            },
        };

        let tls = match &descriptor.tls {
            Some(options) if options.enabled => {
                let cert_chain = match &options.ca_certs {
                    Some(path) => Some(fs::read_to_string(path).map_err(|err| {
                        QueueError::Config(format!("{}: {}", path.display(), err))
                    })?),
                    None => None,
                };
                let identity = match &options.identity {
                    Some(path) => Some((
                        fs::read(path).map_err(|err| {
                            QueueError::Config(format!("{}: {}", path.display(), err))
                        })?,
                        options.identity_password.clone().unwrap_or_default(),
                    )),
                    None => None,
                };
                Some(TlsMaterial {
                    identity,
                    cert_chain,
                })
            }
            _ => None,
        };

        Ok(AmqpConnector {
            uri,
            connection_name: descriptor.name.clone(),
            tls,
        })
    }
}

fn vhost_name(vhost: &str) -> String {
    match vhost.trim_start_matches('/') {
        "" => "/".to_owned(),
        name => name.to_owned(),
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        debug!(queue = %self.connection_name, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connected = match &self.tls {
            Some(tls) => {
                Connection::connect_uri_with_config(self.uri.clone(), options, tls.to_config())
                    .await
            }
            None => Connection::connect_uri(self.uri.clone(), options).await,
        };

        match connected {
            Ok(conn) => {
                debug!(queue = %self.connection_name, "amqp connected");
                Ok(Arc::new(AmqpConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(QueueError::Connection(err.to_string()))
            }
        }
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn open_channel(
        &self,
        publisher_confirms: bool,
    ) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(QueueError::Channel(err.to_string()));
            }
        };

        if publisher_confirms {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(QueueError::Channel(err.to_string()));
            }
        }

        debug!("channel created");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, QueueError> {
        debug!("declaring queue: {}", def.name());

        if let Some(dlq) = def.dlq_definition() {
            self.declare(&dlq).await?;
        }

        let queue = self.declare(def).await?;
        debug!("queue: {} was declared", def.name());
        Ok(queue)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                QueueError::QoSDeclaration(err.to_string())
            })
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), QueueError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.clone()))
            .with_message_id(ShortString::from(message.message_id.clone()))
            .with_headers(to_field_table(&message.headers));

        if let Some(kind) = &message.message_type {
            properties = properties.with_kind(ShortString::from(kind.clone()));
        }

        let confirm = match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(QueueError::Publishing(err.to_string()));
            }
            Ok(c) => c,
        };

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publish confirm");
                Err(QueueError::Publishing(err.to_string()))
            }
            Ok(confirmation) if confirmation.is_nack() => {
                error!(queue = queue, "broker rejected the published message");
                Err(QueueError::Publishing("message nacked by broker".to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(QueueError::Consume(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound_message(delivery)),
                Err(err) => Err(QueueError::Consume(err.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| QueueError::Channel(err.to_string()))
    }
}

impl AmqpChannel {
    async fn declare(&self, def: &QueueDefinition) -> Result<u32, QueueError> {
        let mut args = BTreeMap::new();
        for (key, value) in def.arguments() {
            args.insert(
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            );
        }

        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(QueueError::DeclareQueue(def.name().to_owned()))
            }
            Ok(queue) => Ok(queue.message_count()),
        }
    }
}

/// Delivery handle backed by a lapin acker.
struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                QueueError::AckMessage(err.to_string())
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                QueueError::NackMessage(err.to_string())
            })
    }
}

fn inbound_message(delivery: Delivery) -> InboundMessage {
    let props = &delivery.properties;
    let message_type = props.kind().as_ref().map(|kind| kind.as_str().to_owned());
    let message_id = props.message_id().as_ref().map(|id| id.as_str().to_owned());
    let headers = props
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    InboundMessage::new(
        delivery.data,
        delivery.routing_key.as_str(),
        Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
    .with_message_type(message_type)
    .with_message_id(message_id)
    .with_headers(headers)
    .redelivered(delivery.redelivered)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

/// Keeps the string-valued headers; other AMQP value types are not part of the wire format.
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()?
                    .to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), text))
        })
        .collect()
}

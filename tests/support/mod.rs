// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the broker traits, with an event log of every
//! publish, ack and nack.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use msgqueue::{
    backend::{ConnectorFactory, QueueBackend},
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, Connector, DeliveryStream, Headers,
        InboundMessage, OutboundMessage,
    },
    config::QueueDescriptor,
    errors::QueueError,
    queue::QueueDefinition,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

const POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Published { queue: String, body: Vec<u8> },
    Acked { queue: String, body: Vec<u8> },
    Nacked { queue: String, body: Vec<u8>, requeue: bool },
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    message_type: Option<String>,
    message_id: Option<String>,
    headers: Headers,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Stored>,
    dead_letter_to: Option<String>,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: Stored,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, Unacked>,
    events: Vec<Event>,
    next_tag: u64,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    next_channel: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Published { queue: q, body } if q == queue => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Acked { queue: q, .. } if q == queue))
            .count()
    }

    pub fn nacked(&self, queue: &str, requeue: bool) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, Event::Nacked { queue: q, requeue: r, .. } if q == queue && *r == requeue)
            })
            .count()
    }

    pub fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn declare(&self, def: &QueueDefinition) -> u32 {
        let mut state = self.state.lock();
        if let Some(dlq) = def.dlq_name() {
            state.queues.entry(dlq.to_owned()).or_default();
        }
        let queue = state.queues.entry(def.name().to_owned()).or_default();
        if let Some(dlq) = def.dlq_name() {
            queue.dead_letter_to = Some(dlq.to_owned());
        }
        queue.ready.len() as u32
    }

    fn publish(&self, queue: &str, message: &OutboundMessage) {
        let mut state = self.state.lock();
        state.events.push(Event::Published {
            queue: queue.to_owned(),
            body: message.body.clone(),
        });
        // the default exchange drops messages for undeclared queues
        if let Some(target) = state.queues.get_mut(queue) {
            target.ready.push_back(Stored {
                body: message.body.clone(),
                message_type: message.message_type.clone(),
                message_id: Some(message.message_id.clone()),
                headers: message.headers.clone(),
            });
        }
    }

    fn next_delivery(self: &Arc<Self>, queue: &str, channel: u64) -> Option<InboundMessage> {
        let mut state = self.state.lock();
        let message = state.queues.get_mut(queue)?.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                channel,
                message: message.clone(),
            },
        );

        let acker = Arc::new(MemoryAcker {
            broker: self.clone(),
            tag,
        });
        Some(
            InboundMessage::new(message.body, queue, acker)
                .with_message_type(message.message_type)
                .with_message_id(message.message_id)
                .with_headers(message.headers),
        )
    }

    fn settle(&self, tag: u64, requeue: Option<bool>) -> bool {
        let mut state = self.state.lock();
        let Some(Unacked { queue, message, .. }) = state.unacked.remove(&tag) else {
            return false;
        };

        match requeue {
            None => state.events.push(Event::Acked {
                queue: queue.clone(),
                body: message.body.clone(),
            }),
            Some(requeue) => {
                state.events.push(Event::Nacked {
                    queue: queue.clone(),
                    body: message.body.clone(),
                    requeue,
                });
                let dead_letter_to = state
                    .queues
                    .get(&queue)
                    .and_then(|q| q.dead_letter_to.clone());
                let target = if requeue {
                    Some(queue)
                } else {
                    dead_letter_to
                };
                if let Some(target) = target {
                    if let Some(target) = state.queues.get_mut(&target) {
                        if requeue {
                            target.ready.push_front(message);
                        } else {
                            target.ready.push_back(message);
                        }
                    }
                }
            }
        }
        true
    }

    fn close_channel(&self, channel: u64) {
        let mut state = self.state.lock();
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(Unacked { queue, message, .. }) = state.unacked.remove(&tag) {
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.ready.push_front(message);
                }
            }
        }
    }
}

struct MemoryAcker {
    broker: Arc<MemoryBroker>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        if self.broker.settle(self.tag, None) {
            Ok(())
        } else {
            Err(QueueError::AckMessage(format!("unknown delivery tag {}", self.tag)))
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        if self.broker.settle(self.tag, Some(requeue)) {
            Ok(())
        } else {
            Err(QueueError::NackMessage(format!("unknown delivery tag {}", self.tag)))
        }
    }
}

pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self, _: bool) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        if !self.is_open() {
            return Err(QueueError::Channel("connection closed".into()));
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id: self.broker.next_channel.fetch_add(1, Ordering::SeqCst),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, QueueError> {
        Ok(self.broker.declare(def))
    }

    async fn set_prefetch(&self, _: u16) -> Result<(), QueueError> {
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<(), QueueError> {
        self.broker.publish(queue, message);
        Ok(())
    }

    async fn consume(&self, queue: &str, _: &str) -> Result<DeliveryStream, QueueError> {
        let state = (
            self.broker.clone(),
            queue.to_owned(),
            self.id,
            self.open.clone(),
        );
        Ok(stream::unfold(state, |(broker, queue, channel, open)| async move {
            loop {
                if !open.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(message) = broker.next_delivery(&queue, channel) {
                    return Some((Ok(message), (broker, queue, channel, open)));
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.close_channel(self.id);
        Ok(())
    }
}

/// Connector factory opening connections to `broker` for every queue.
pub fn connectors(broker: Arc<MemoryBroker>) -> ConnectorFactory {
    Arc::new(move |_: QueueBackend, _: &QueueDescriptor| {
        Ok(Arc::new(MemoryConnector::new(broker.clone())) as Arc<dyn Connector>)
    })
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! Message broker abstraction for the tiered pipeline queues.
//!
//! Provides a trait-based broker that allows swapping between a real NATS
//! connection and an in-memory double. Delivery is at-least-once; multiple
//! workers receiving from the same queue compete for messages (each message
//! is delivered to exactly one of them).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::errors::SyncError;

/// Trait for publish/receive operations on named queues.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to a queue.
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), SyncError>;

    /// Receive the next message from a queue, or `None` if the queue is
    /// currently empty. Competing consumers each see a disjoint subset.
    async fn try_receive(&self, queue: &str) -> Result<Option<Bytes>, SyncError>;
}

/// Real broker backed by NATS queue-group subscriptions.
///
/// All workers share one delivery group per queue, which gives
/// competing-consumer semantics: NATS delivers each message to exactly one
/// member of the group.
pub struct NatsBroker {
    client: async_nats::Client,
    group: String,
    receive_timeout: Duration,
    subscribers: Mutex<HashMap<String, Arc<Mutex<async_nats::Subscriber>>>>,
}

impl NatsBroker {
    pub fn new(client: async_nats::Client) -> Self {
        Self::with_group(client, "pipeline-workers")
    }

    pub fn with_group(client: async_nats::Client, group: impl Into<String>) -> Self {
        Self {
            client,
            group: group.into(),
            receive_timeout: Duration::from_millis(500),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    async fn subscriber(&self, queue: &str) -> Result<Arc<Mutex<async_nats::Subscriber>>, SyncError> {
        let mut subs = self.subscribers.lock().await;
        if let Some(sub) = subs.get(queue) {
            return Ok(Arc::clone(sub));
        }
        let sub = self
            .client
            .queue_subscribe(queue.to_string(), self.group.clone())
            .await
            .map_err(|e| SyncError::Broker(e.to_string()))?;
        let sub = Arc::new(Mutex::new(sub));
        subs.insert(queue.to_string(), Arc::clone(&sub));
        Ok(sub)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), SyncError> {
        self.client
            .publish(queue.to_string(), payload)
            .await
            .map_err(|e| SyncError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn try_receive(&self, queue: &str) -> Result<Option<Bytes>, SyncError> {
        let sub = self.subscriber(queue).await?;
        let mut sub = sub.lock().await;
        match tokio::time::timeout(self.receive_timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(Some(msg.payload)),
            Ok(None) => Ok(None),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// In-memory broker for tests and single-process runs.
///
/// FIFO per queue. Concurrent receivers pop disjoint messages, which models
/// the competing-consumer semantics of the real broker closely enough for
/// the pipeline's ordering rules (flags, not queue position).
#[derive(Default)]
pub struct InMemoryBroker {
    queues: std::sync::Mutex<HashMap<String, VecDeque<Bytes>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently waiting on a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Total messages waiting across all queues.
    pub fn total_len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// Snapshot of the messages waiting on a queue without consuming them.
    pub fn peek_all(&self, queue: &str) -> Vec<Bytes> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), SyncError> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn try_receive(&self, queue: &str) -> Result<Option<Bytes>, SyncError> {
        Ok(self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }
}

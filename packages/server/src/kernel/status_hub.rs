//! Status hub: in-process pub/sub for live job status updates.
//!
//! Topics are keyed by `(tenant, job, stage)`. Stage workers publish a
//! status frame after every stage transition; WebSocket observers
//! subscribe to the topics they watch. Publishing to a topic with no
//! subscribers is a no-op, and senders whose receivers are all gone are
//! pruned on the next publish.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::kernel::pipeline::message::StageType;

const CHANNEL_CAPACITY: usize = 64;

/// Topic key for one (tenant, job, stage) stream.
pub fn topic(tenant_id: Uuid, job_id: Uuid, stage: StageType) -> String {
    format!("{tenant_id}:{job_id}:{}", stage.as_str())
}

#[derive(Default)]
pub struct StatusHub {
    channels: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a frame to a topic. Slow consumers observe `Lagged` on
    /// their receiver and miss frames; they never block the publisher.
    pub fn publish(&self, topic: &str, frame: serde_json::Value) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(topic) {
            if sender.send(frame).is_err() {
                // Last receiver dropped.
                channels.remove(topic);
                debug!(topic = %topic, "pruned status topic with no subscribers");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

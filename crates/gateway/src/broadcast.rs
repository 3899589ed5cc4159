use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    pollcast_polls::broadcast::EventPublisher,
    serde::{Deserialize, Serialize},
    tokio::sync::broadcast,
    tracing::{debug, warn},
};

/// Frames buffered per channel before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 256;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// What a subscriber receives for every publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String,
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub seq: u64,
}

// ── Broadcaster ──────────────────────────────────────────────────────────────

/// Named-channel fan-out hub.
///
/// Publishing to a channel nobody listens to is a no-op: nothing is stored
/// and nothing is replayed to later subscribers.
pub struct Broadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<str>>>>,
    seq: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Receive every frame published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<str>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of channels with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels.len()
    }

    fn sender(&self, channel: &str) -> Option<broadcast::Sender<Arc<str>>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        match channels.get(channel) {
            Some(tx) if tx.receiver_count() > 0 => Some(tx.clone()),
            Some(_) => {
                channels.remove(channel);
                None
            },
            None => None,
        }
    }
}

#[async_trait]
impl EventPublisher for Broadcaster {
    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let seq = self.next_seq();
        let Some(tx) = self.sender(channel) else {
            debug!(channel, event, seq, "no subscribers, event dropped");
            return;
        };
        let frame = EventFrame {
            r#type: "event".into(),
            channel: channel.into(),
            event: event.into(),
            payload,
            seq,
        };
        let json = match serde_json::to_string(&frame) {
            Ok(j) => j,
            Err(e) => {
                warn!(channel, event, "failed to serialize broadcast event: {e}");
                return;
            },
        };
        let delivered = tx.send(Arc::from(json)).unwrap_or(0);
        debug!(channel, event, seq, delivered, "broadcasting event");
    }
}

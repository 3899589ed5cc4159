use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

/// Vote counts by 0-indexed option.
pub type VoteCounts = BTreeMap<usize, u64>;

/// Identifies the counter set of one streamer's channel within one poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub poll_id: String,
    pub streamer_id: String,
}

impl CounterKey {
    pub fn new(poll_id: impl Into<String>, streamer_id: impl Into<String>) -> Self {
        Self {
            poll_id: poll_id.into(),
            streamer_id: streamer_id.into(),
        }
    }

    /// Storage key under `prefix`, shared by every backend.
    #[must_use]
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{prefix}:poll:{}:streamer:{}:votes",
            self.poll_id, self.streamer_id
        )
    }
}

/// Counter backend used by chat vote channels and the aggregation loop.
#[async_trait]
pub trait VoteCounterStore: Send + Sync {
    /// Add one vote for `option_index`, returning the new count.
    async fn increment(&self, key: &CounterKey, option_index: usize) -> Result<u64>;

    /// All non-zero counters for `key`. Missing or expired keys read as empty.
    async fn read_all(&self, key: &CounterKey) -> Result<VoteCounts>;

    /// Expire every counter of `key` after `seconds`.
    async fn set_ttl(&self, key: &CounterKey, seconds: u64) -> Result<()>;
}

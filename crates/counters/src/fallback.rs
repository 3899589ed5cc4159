use std::sync::Arc;

use {async_trait::async_trait, tracing::warn};

use crate::{
    error::Result,
    memory::InMemoryCounterStore,
    store::{CounterKey, VoteCounterStore, VoteCounts},
};

/// Shared store with a transparent in-process fallback.
///
/// Writes that fail on the primary land in the local map, so reads sum both
/// sides while the primary is healthy and serve the local side alone while
/// it is not. No operation ever returns an error.
pub struct FallbackCounterStore {
    primary: Option<Arc<dyn VoteCounterStore>>,
    local: InMemoryCounterStore,
}

impl FallbackCounterStore {
    pub fn new(primary: Arc<dyn VoteCounterStore>) -> Self {
        Self {
            primary: Some(primary),
            local: InMemoryCounterStore::new(),
        }
    }

    /// Store without a shared backend.
    pub fn local_only() -> Self {
        Self {
            primary: None,
            local: InMemoryCounterStore::new(),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }
}

#[async_trait]
impl VoteCounterStore for FallbackCounterStore {
    async fn increment(&self, key: &CounterKey, option_index: usize) -> Result<u64> {
        if let Some(primary) = &self.primary {
            match primary.increment(key, option_index).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    warn!(
                        poll_id = %key.poll_id,
                        streamer_id = %key.streamer_id,
                        error = %e,
                        "counter increment fell back to memory"
                    );
                },
            }
        }
        self.local.increment(key, option_index).await
    }

    async fn read_all(&self, key: &CounterKey) -> Result<VoteCounts> {
        let mut counts = self.local.read_all(key).await?;
        if let Some(primary) = &self.primary {
            match primary.read_all(key).await {
                Ok(shared) => {
                    for (index, n) in shared {
                        *counts.entry(index).or_insert(0) += n;
                    }
                },
                Err(e) => {
                    warn!(
                        poll_id = %key.poll_id,
                        streamer_id = %key.streamer_id,
                        error = %e,
                        "counter read fell back to memory"
                    );
                },
            }
        }
        Ok(counts)
    }

    async fn set_ttl(&self, key: &CounterKey, seconds: u64) -> Result<()> {
        if let Some(primary) = &self.primary
            && let Err(e) = primary.set_ttl(key, seconds).await
        {
            warn!(
                poll_id = %key.poll_id,
                streamer_id = %key.streamer_id,
                error = %e,
                "counter ttl applied to memory only"
            );
        }
        self.local.set_ttl(key, seconds).await
    }
}

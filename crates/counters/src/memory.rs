use std::{collections::HashMap, sync::Mutex, time::Duration};

use {async_trait::async_trait, tokio::time::Instant};

use crate::{
    error::Result,
    store::{CounterKey, VoteCounterStore, VoteCounts},
};

#[derive(Debug, Default)]
struct Entry {
    counts: VoteCounts,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local counters keyed exactly like the Redis backend.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<CounterKey, Entry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counter sets. Expired sets are dropped first.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VoteCounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &CounterKey, option_index: usize) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = entries.entry(key.clone()).or_default();
        if entry.expired(now) {
            *entry = Entry::default();
        }
        let count = entry.counts.entry(option_index).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn read_all(&self, key: &CounterKey) -> Result<VoteCounts> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(VoteCounts::new())
            },
            Some(entry) => Ok(entry.counts.clone()),
            None => Ok(VoteCounts::new()),
        }
    }

    async fn set_ttl(&self, key: &CounterKey, seconds: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.clone()).or_default();
        entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        Ok(())
    }
}

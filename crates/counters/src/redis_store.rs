use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    redis::{AsyncCommands, aio::ConnectionManager},
    tracing::{debug, info},
};

use crate::{
    error::{Error, Result},
    store::{CounterKey, VoteCounterStore, VoteCounts},
};

/// Upper bound on a single Redis round trip before it counts as a failure.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(750);

/// Redis-backed counters: one hash per (poll, streamer), one field per option.
///
/// `EXPIRE` on a key that does not exist yet is a no-op, so the expiry set by
/// [`VoteCounterStore::set_ttl`] is remembered as a unix deadline and applied
/// again with every increment.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    prefix: String,
    expiries: Arc<Mutex<HashMap<String, i64>>>,
}

impl RedisCounterStore {
    /// Open a managed, auto-reconnecting connection to `url`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout { millis: 5_000 })??;
        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to redis vote counter store");
        Ok(Self {
            conn,
            prefix,
            expiries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn expiry(&self, redis_key: &str) -> Option<i64> {
        self.expiries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(redis_key)
            .copied()
    }

    fn remember_expiry(&self, redis_key: String, expires_at: i64) {
        let now = unix_now();
        let mut expiries = self.expiries.lock().unwrap_or_else(|e| e.into_inner());
        expiries.retain(|_, at| *at > now);
        expiries.insert(redis_key, expires_at);
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Timeout {
                millis: COMMAND_TIMEOUT.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl VoteCounterStore for RedisCounterStore {
    async fn increment(&self, key: &CounterKey, option_index: usize) -> Result<u64> {
        let mut conn = self.conn.clone();
        let redis_key = key.storage_key(&self.prefix);
        let pipe = increment_pipeline(&redis_key, option_index, self.expiry(&redis_key));
        let (count,): (i64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        debug!(key = %redis_key, option_index, count, "vote counted");
        Ok(count.max(0) as u64)
    }

    async fn read_all(&self, key: &CounterKey) -> Result<VoteCounts> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, i64> = self
            .bounded(conn.hgetall(key.storage_key(&self.prefix)))
            .await?;
        Ok(parse_counts(raw))
    }

    async fn set_ttl(&self, key: &CounterKey, seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let redis_key = key.storage_key(&self.prefix);
        let expires_at = unix_now().saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX));
        self.remember_expiry(redis_key.clone(), expires_at);
        let _: bool = self.bounded(conn.expire_at(&redis_key, expires_at)).await?;
        Ok(())
    }
}

/// `HINCRBY` and, once a TTL is known, `EXPIREAT` in one transaction.
fn increment_pipeline(redis_key: &str, option_index: usize, expires_at: Option<i64>) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic().hincr(redis_key, option_index, 1_i64);
    if let Some(at) = expires_at {
        pipe.expire_at(redis_key, at).ignore();
    }
    pipe
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Hash fields hold option indexes; anything else is skipped.
fn parse_counts(raw: impl IntoIterator<Item = (String, i64)>) -> VoteCounts {
    raw.into_iter()
        .filter_map(|(field, count)| {
            let index = field.parse::<usize>().ok()?;
            (count > 0).then_some((index, count as u64))
        })
        .collect()
}

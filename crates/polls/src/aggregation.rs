//! One refresh-and-publish pass over a running poll's channels.

use std::{collections::HashMap, sync::Arc};

use {
    pollcast_counters::{CounterKey, VoteCounterStore},
    tokio::sync::OwnedMutexGuard,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    aggregate::Aggregate,
    broadcast::PollBroadcaster,
    error::{Error, Result},
    native::NativePollAdapter,
    provider::RemotePoll,
    store::PollStore,
    types::{ChannelLink, ChannelMode, LinkStatus, Poll},
};

/// Refreshes channel counts and publishes the merged tally.
///
/// Every refresh of a poll's links runs under that poll's guard, so two
/// refreshes of the same channel never overlap and teardown can exclude a
/// straggling tick by holding the guard.
pub struct Aggregator {
    store: Arc<dyn PollStore>,
    native: Arc<NativePollAdapter>,
    counters: Arc<dyn VoteCounterStore>,
    broadcaster: Arc<PollBroadcaster>,
    guards: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn PollStore>,
        native: Arc<NativePollAdapter>,
        counters: Arc<dyn VoteCounterStore>,
        broadcaster: Arc<PollBroadcaster>,
    ) -> Self {
        Self {
            store,
            native,
            counters,
            broadcaster,
            guards: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to the links of `poll_id`.
    pub async fn lock_poll(&self, poll_id: &str) -> OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(guards.entry(poll_id.to_string()).or_default())
        };
        guard.lock_owned().await
    }

    /// Drop the guard of `poll_id` once nobody holds or awaits it.
    pub fn forget(&self, poll_id: &str) {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        if guards
            .get(poll_id)
            .is_some_and(|guard| Arc::strong_count(guard) == 1)
        {
            guards.remove(poll_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_polls(&self) -> usize {
        self.guards.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Refresh every live link of `poll` and return all links, terminal ones
    /// included. Per-channel failures are logged and leave that link as stored.
    pub async fn refresh_links(&self, poll: &Poll) -> Result<Vec<ChannelLink>> {
        let _guard = self.lock_poll(&poll.id).await;
        self.refresh_locked(poll).await
    }

    /// Same as [`Self::refresh_links`] for a caller already holding the guard.
    pub async fn refresh_locked(&self, poll: &Poll) -> Result<Vec<ChannelLink>> {
        let links = self.store.list_links(&poll.id).await?;
        Ok(futures::future::join_all(links.into_iter().map(|link| self.refresh_link(poll, link))).await)
    }

    /// One aggregation tick. Publishes nothing when `cancel` fired while the
    /// channels were being read.
    pub async fn tick(&self, poll: &Poll, cancel: &CancellationToken) -> Result<Option<Aggregate>> {
        let links = self.refresh_links(poll).await?;
        if cancel.is_cancelled() {
            debug!(poll_id = %poll.id, "tick cancelled before publish");
            return Ok(None);
        }
        let aggregate = Aggregate::from_links(poll, &links);
        debug!(
            poll_id = %poll.id,
            channels = links.len(),
            total_votes = aggregate.total_votes,
            "aggregation tick"
        );
        self.broadcaster.update(&aggregate).await;
        Ok(Some(aggregate))
    }

    async fn refresh_link(&self, poll: &Poll, mut link: ChannelLink) -> ChannelLink {
        if link.status.is_terminal() {
            return link;
        }
        let fetched = match &link.mode {
            ChannelMode::Native {
                remote_poll_id: Some(remote_id),
            } => self
                .fetch_native(&link.streamer_id, remote_id)
                .await
                .map(|remote| (remote.votes, Some(remote.status.link_status()))),
            // never reached the provider
            ChannelMode::Native {
                remote_poll_id: None,
            } => return link,
            ChannelMode::Chat { .. } => self
                .fetch_chat(poll, &link.streamer_id)
                .await
                .map(|votes| (votes, None)),
        };

        match fetched {
            Ok((votes, status)) => {
                let mut changed = link.absorb_counts(&votes);
                if let Some(status) = status {
                    // an unknown remote status keeps the current one
                    if status != LinkStatus::Created && status != link.status {
                        link.set_status(status);
                        changed = true;
                    }
                }
                if changed && let Err(e) = self.store.update_link(&link).await {
                    warn!(
                        poll_id = %poll.id,
                        streamer_id = %link.streamer_id,
                        error = %e,
                        "failed to persist refreshed counts"
                    );
                }
            },
            Err(e) => {
                warn!(
                    poll_id = %poll.id,
                    streamer_id = %link.streamer_id,
                    error = %e,
                    "channel refresh failed, skipping"
                );
            },
        }
        link
    }

    async fn fetch_native(&self, streamer_id: &str, remote_id: &str) -> Result<RemotePoll> {
        let streamer = self
            .store
            .get_streamer(streamer_id)
            .await?
            .ok_or_else(|| Error::aggregation_fetch(streamer_id, "streamer not found"))?;
        match self.native.get_poll(&streamer, remote_id).await {
            Ok(remote) => Ok(remote),
            Err(e @ Error::Unauthorized { .. }) => {
                warn!(streamer_id, "credential rejected during refresh, deactivating");
                if let Err(err) = self.store.deactivate_credential(streamer_id).await {
                    warn!(streamer_id, error = %err, "failed to deactivate credential");
                }
                Err(e)
            },
            Err(e) => Err(Error::aggregation_fetch(streamer_id, e.to_string())),
        }
    }

    async fn fetch_chat(&self, poll: &Poll, streamer_id: &str) -> Result<Vec<u64>> {
        let counts = self
            .counters
            .read_all(&CounterKey::new(&poll.id, streamer_id))
            .await
            .map_err(|e| Error::aggregation_fetch(streamer_id, e.to_string()))?;
        let mut votes = vec![0; poll.options.len()];
        for (index, n) in counts {
            if let Some(slot) = votes.get_mut(index) {
                *slot = n;
            }
        }
        Ok(votes)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            broadcast::{POLL_UPDATE, poll_channel},
            provider::RemotePollStatus,
            store_memory::InMemoryPollStore,
            testing::{FakeNative, FixedRefresher, RecordingPublisher},
            types::{Streamer, StreamerCredential},
        },
        pollcast_counters::InMemoryCounterStore,
    };

    struct Harness {
        aggregator: Aggregator,
        store: Arc<InMemoryPollStore>,
        api: Arc<FakeNative>,
        counters: Arc<InMemoryCounterStore>,
        publisher: Arc<RecordingPublisher>,
        poll: Poll,
    }

    async fn streamer(store: &InMemoryPollStore, id: &str, tier: Option<&str>) {
        store
            .upsert_streamer(&Streamer {
                id: id.into(),
                login: id.into(),
                display_name: id.into(),
                provider_user_id: format!("b-{id}"),
                broadcaster_type: tier.map(Into::into),
                active: true,
            })
            .await
            .unwrap();
        store
            .save_credential(&StreamerCredential::new(id, "token", "refresh"))
            .await
            .unwrap();
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryPollStore::new());
        let api = Arc::new(FakeNative::default());
        let counters = Arc::new(InMemoryCounterStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let native = Arc::new(NativePollAdapter::new(
            api.clone(),
            Arc::new(FixedRefresher),
            store.clone(),
        ));
        let broadcaster = Arc::new(PollBroadcaster::new(publisher.clone(), store.clone()));
        let aggregator = Aggregator::new(store.clone(), native, counters.clone(), broadcaster);

        let poll = Poll::new("Pick", vec!["A".into(), "B".into(), "C".into()], 60);
        store.create_poll(&poll).await.unwrap();

        streamer(&store, "n1", Some("partner")).await;
        streamer(&store, "n2", Some("affiliate")).await;
        streamer(&store, "c1", None).await;
        for id in ["n1", "n2"] {
            let mode = ChannelMode::Native {
                remote_poll_id: Some(format!("remote-b-{id}")),
            };
            store
                .insert_link(&ChannelLink::new(&poll, id, mode, LinkStatus::Created))
                .await
                .unwrap();
        }
        let chat = ChannelMode::Chat {
            channel_login: "c1".into(),
        };
        store
            .insert_link(&ChannelLink::new(&poll, "c1", chat, LinkStatus::Running))
            .await
            .unwrap();

        Harness {
            aggregator,
            store,
            api,
            counters,
            publisher,
            poll,
        }
    }

    async fn vote(counters: &InMemoryCounterStore, poll: &Poll, streamer: &str, index: usize) {
        counters
            .increment(&CounterKey::new(&poll.id, streamer), index)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn merges_native_and_chat_counts() {
        let h = harness().await;
        h.api.set_votes("b-n1", vec![3, 1, 0]);
        h.api.set_votes("b-n2", vec![0, 2, 0]);
        vote(&h.counters, &h.poll, "c1", 0).await;
        vote(&h.counters, &h.poll, "c1", 2).await;

        let aggregate = h
            .aggregator
            .tick(&h.poll, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(aggregate.votes, vec![4, 3, 1]);
        assert_eq!(aggregate.total_votes, 8);
        assert_eq!(aggregate.votes.iter().sum::<u64>(), aggregate.total_votes);

        let links = h.store.list_links(&h.poll.id).await.unwrap();
        let n1 = links.iter().find(|l| l.streamer_id == "n1").unwrap();
        assert_eq!(n1.status, LinkStatus::Running);
        assert_eq!(n1.votes, vec![3, 1, 0]);

        let updates = h.publisher.on(&poll_channel(&h.poll.id), POLL_UPDATE);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["total_votes"], 8);
    }

    #[tokio::test]
    async fn failing_channel_is_skipped() {
        let h = harness().await;
        h.api.set_votes("b-n1", vec![1, 0, 0]);
        h.aggregator
            .tick(&h.poll, &CancellationToken::new())
            .await
            .unwrap();

        h.api.broken_reads.lock().unwrap().insert("b-n1".into());
        h.api.set_votes("b-n2", vec![0, 0, 5]);
        let aggregate = h
            .aggregator
            .tick(&h.poll, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        // n1 keeps its last known counts
        assert_eq!(aggregate.votes, vec![1, 0, 5]);
        assert_eq!(h.publisher.on(&poll_channel(&h.poll.id), POLL_UPDATE).len(), 2);
    }

    #[tokio::test]
    async fn counts_never_decrease() {
        let h = harness().await;
        h.api.set_votes("b-n1", vec![5, 5, 0]);
        h.aggregator.refresh_links(&h.poll).await.unwrap();
        h.api.set_votes("b-n1", vec![2, 6, 0]);
        let links = h.aggregator.refresh_links(&h.poll).await.unwrap();
        let n1 = links.iter().find(|l| l.streamer_id == "n1").unwrap();
        assert_eq!(n1.votes, vec![5, 6, 0]);
    }

    #[tokio::test]
    async fn remote_status_is_mapped() {
        let h = harness().await;
        h.api
            .status
            .lock()
            .unwrap()
            .insert("b-n1".into(), RemotePollStatus::Moderated);
        h.api
            .status
            .lock()
            .unwrap()
            .insert("b-n2".into(), RemotePollStatus::Unknown("WEIRD".into()));
        let links = h.aggregator.refresh_links(&h.poll).await.unwrap();
        let status = |id: &str| links.iter().find(|l| l.streamer_id == id).unwrap().status;
        assert_eq!(status("n1"), LinkStatus::Terminated);
        assert_eq!(status("n2"), LinkStatus::Created);
        assert_eq!(status("c1"), LinkStatus::Running);
    }

    #[tokio::test]
    async fn rejected_credential_is_deactivated() {
        let h = harness().await;
        h.api.reject.lock().unwrap().insert("b-n2".into());
        h.aggregator.refresh_links(&h.poll).await.unwrap();
        assert!(!h.store.get_credential("n2").await.unwrap().unwrap().active);
        assert!(h.store.get_credential("n1").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn cancelled_tick_publishes_nothing() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(h.aggregator.tick(&h.poll, &cancel).await.unwrap().is_none());
        assert!(h.publisher.events.lock().unwrap().is_empty());
    }
}

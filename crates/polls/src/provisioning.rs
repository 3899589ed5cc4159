//! Opens one voting channel per streamer when a poll launches.

use std::{collections::HashSet, sync::Arc};

use {
    pollcast_config::MessagesConfig,
    pollcast_counters::{CounterKey, VoteCounterStore},
    serde::Serialize,
    tokio::time::Instant,
    tracing::{info, warn},
};

use crate::{
    chat::{ChatKey, ChatVoteChannels, format_intro},
    countdown::CountdownAnnouncer,
    error::{Error, Result},
    native::NativePollAdapter,
    provider::ChatIdentity,
    store::PollStore,
    types::{ChannelLink, ChannelMode, LinkStatus, ModeKind, Poll, Streamer},
};

/// A streamer whose channel could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStreamer {
    pub streamer_id: String,
    pub mode: ModeKind,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProvisioningReport {
    pub links: Vec<ChannelLink>,
    pub failed: Vec<FailedStreamer>,
}

pub struct Provisioner {
    store: Arc<dyn PollStore>,
    native: Arc<NativePollAdapter>,
    chat: Arc<ChatVoteChannels>,
    counters: Arc<dyn VoteCounterStore>,
    countdown: Arc<CountdownAnnouncer>,
    messages: MessagesConfig,
    counter_grace_secs: u64,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn PollStore>,
        native: Arc<NativePollAdapter>,
        chat: Arc<ChatVoteChannels>,
        counters: Arc<dyn VoteCounterStore>,
        countdown: Arc<CountdownAnnouncer>,
        messages: MessagesConfig,
        counter_grace_secs: u64,
    ) -> Self {
        Self {
            store,
            native,
            chat,
            counters,
            countdown,
            messages,
            counter_grace_secs,
        }
    }

    /// Open a channel on every streamer concurrently.
    ///
    /// A streamer's failure lands in [`ProvisioningReport::failed`] and never
    /// affects the others. Streamers listed twice are provisioned once. The
    /// chat countdown runs against `started`, the launch instant.
    pub async fn provision(
        &self,
        poll: &Poll,
        streamers: &[Streamer],
        started: Instant,
    ) -> ProvisioningReport {
        let mut seen = HashSet::new();
        let unique: Vec<&Streamer> = streamers
            .iter()
            .filter(|s| seen.insert(s.id.as_str()))
            .collect();

        let outcomes =
            futures::future::join_all(unique.iter().map(|s| self.provision_one(poll, s))).await;

        let mut report = ProvisioningReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(link) => report.links.push(link),
                Err(failed) => report.failed.push(failed),
            }
        }

        let chat_streamers: Vec<String> = report
            .links
            .iter()
            .filter(|l| l.mode.kind() == ModeKind::Chat && l.status == LinkStatus::Running)
            .map(|l| l.streamer_id.clone())
            .collect();
        if !chat_streamers.is_empty() {
            self.countdown
                .schedule(&poll.id, poll.duration_secs, chat_streamers, started);
        }

        info!(
            poll_id = %poll.id,
            opened = report.links.len(),
            failed = report.failed.len(),
            "channels provisioned"
        );
        report
    }

    async fn provision_one(
        &self,
        poll: &Poll,
        streamer: &Streamer,
    ) -> std::result::Result<ChannelLink, FailedStreamer> {
        let mode = streamer.eligible_mode();
        let initial = match mode {
            ModeKind::Native => ChannelMode::Native {
                remote_poll_id: None,
            },
            ModeKind::Chat => ChannelMode::Chat {
                channel_login: streamer.login.clone(),
            },
        };
        let failed = |reason: String| FailedStreamer {
            streamer_id: streamer.id.clone(),
            mode,
            reason,
        };

        // The placeholder claims the (poll, streamer) slot before any side effect.
        let mut link = ChannelLink::new(poll, &streamer.id, initial, LinkStatus::Created);
        if let Err(e) = self.store.insert_link(&link).await {
            warn!(poll_id = %poll.id, streamer_id = %streamer.id, error = %e, "channel link not created");
            return Err(failed(e.to_string()));
        }

        let opened = match mode {
            ModeKind::Native => self.open_native(poll, streamer, &mut link).await,
            ModeKind::Chat => self.open_chat(poll, streamer, &mut link).await,
        };

        match opened {
            Ok(()) => {
                if let Err(e) = self.store.update_link(&link).await {
                    warn!(poll_id = %poll.id, streamer_id = %streamer.id, error = %e, "failed to persist channel link");
                }
                Ok(link)
            },
            Err(e) => {
                let reason = e.to_string();
                if matches!(e, Error::Unauthorized { .. }) {
                    warn!(streamer_id = %streamer.id, "credential rejected, deactivating");
                    if let Err(e) = self.store.deactivate_credential(&streamer.id).await {
                        warn!(streamer_id = %streamer.id, error = %e, "failed to deactivate credential");
                    }
                }
                warn!(
                    poll_id = %poll.id,
                    streamer_id = %streamer.id,
                    mode = mode.as_str(),
                    reason = %reason,
                    "channel provisioning failed"
                );
                link.set_status(LinkStatus::Failed);
                link.failure = Some(reason.clone());
                if let Err(e) = self.store.update_link(&link).await {
                    warn!(poll_id = %poll.id, streamer_id = %streamer.id, error = %e, "failed to persist channel link");
                }
                Err(failed(reason))
            },
        }
    }

    async fn open_native(&self, poll: &Poll, streamer: &Streamer, link: &mut ChannelLink) -> Result<()> {
        let remote = self.native.create_poll(streamer, poll).await?;
        link.mode = ChannelMode::Native {
            remote_poll_id: Some(remote.id),
        };
        link.set_status(LinkStatus::Created);
        Ok(())
    }

    async fn open_chat(&self, poll: &Poll, streamer: &Streamer, link: &mut ChannelLink) -> Result<()> {
        let credential = self
            .store
            .get_credential(&streamer.id)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| Error::provisioning(&streamer.id, "no active credential"))?;

        let key = ChatKey::new(&streamer.id, &poll.id);
        let identity = ChatIdentity {
            login: streamer.login.clone(),
            access_token: credential.access_token,
            channel: streamer.login.clone(),
        };
        self.chat.open(key.clone(), identity, poll.options.len()).await?;
        self.chat.send(&key, &format_intro(&self.messages, poll)).await;

        let ttl = u64::from(poll.duration_secs) + self.counter_grace_secs;
        if let Err(e) = self
            .counters
            .set_ttl(&CounterKey::new(&poll.id, &streamer.id), ttl)
            .await
        {
            warn!(poll_id = %poll.id, streamer_id = %streamer.id, error = %e, "counter ttl not set");
        }

        link.set_status(LinkStatus::Running);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        crate::{
            store_memory::InMemoryPollStore,
            testing::{FakeChat, FakeNative, FixedRefresher},
            types::StreamerCredential,
        },
        pollcast_counters::InMemoryCounterStore,
    };

    struct Harness {
        provisioner: Provisioner,
        store: Arc<InMemoryPollStore>,
        api: Arc<FakeNative>,
        chat: Arc<FakeChat>,
        countdown: Arc<CountdownAnnouncer>,
    }

    async fn harness(streamers: &[(&str, Option<&str>)]) -> (Harness, Vec<Streamer>) {
        let store = Arc::new(InMemoryPollStore::new());
        let mut list = Vec::new();
        for (id, tier) in streamers {
            let streamer = Streamer {
                id: (*id).into(),
                login: format!("{id}_tv"),
                display_name: (*id).into(),
                provider_user_id: format!("b-{id}"),
                broadcaster_type: tier.map(Into::into),
                active: true,
            };
            store.upsert_streamer(&streamer).await.unwrap();
            store
                .save_credential(&StreamerCredential::new(*id, "token", "refresh"))
                .await
                .unwrap();
            list.push(streamer);
        }
        let api = Arc::new(FakeNative::default());
        let chat = Arc::new(FakeChat::default());
        let counters = Arc::new(InMemoryCounterStore::new());
        let channels = Arc::new(ChatVoteChannels::new(
            chat.clone(),
            counters.clone(),
            Duration::ZERO,
        ));
        let countdown = Arc::new(CountdownAnnouncer::new(
            Arc::clone(&channels),
            MessagesConfig::default(),
        ));
        let native = Arc::new(NativePollAdapter::new(
            api.clone(),
            Arc::new(FixedRefresher),
            store.clone(),
        ));
        let provisioner = Provisioner::new(
            store.clone(),
            native,
            channels,
            counters,
            Arc::clone(&countdown),
            MessagesConfig::default(),
            300,
        );
        (
            Harness {
                provisioner,
                store,
                api,
                chat,
                countdown,
            },
            list,
        )
    }

    fn poll() -> Poll {
        Poll::new("Pick one", vec!["Red".into(), "Blue".into()], 60)
    }

    #[tokio::test]
    async fn modes_follow_account_tier() {
        let (h, streamers) =
            harness(&[("p", Some("partner")), ("a", Some("affiliate")), ("c", None)]).await;
        let poll = poll();
        let report = h.provisioner.provision(&poll, &streamers, Instant::now()).await;

        assert!(report.failed.is_empty());
        assert_eq!(report.links.len(), 3);
        assert_eq!(h.api.created.lock().unwrap().len(), 2);

        let links = h.store.list_links(&poll.id).await.unwrap();
        let native: Vec<_> = links.iter().filter(|l| l.mode.kind() == ModeKind::Native).collect();
        assert_eq!(native.len(), 2);
        assert!(native.iter().all(|l| l.status == LinkStatus::Created));
        assert!(native.iter().all(|l| l.remote_poll_id().is_some()));

        let chat = links.iter().find(|l| l.streamer_id == "c").unwrap();
        assert_eq!(chat.status, LinkStatus::Running);
        let intro = h.chat.lines("c_tv");
        assert_eq!(intro[1], "Pick one");
        assert!(h.countdown.is_scheduled(&poll.id));
    }

    #[tokio::test]
    async fn rejected_native_credential_is_isolated() {
        let (h, streamers) = harness(&[("bad", Some("partner")), ("good", Some("partner"))]).await;
        h.api.reject.lock().unwrap().insert("b-bad".into());
        let poll = poll();
        let report = h.provisioner.provision(&poll, &streamers, Instant::now()).await;

        assert_eq!(report.links.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].streamer_id, "bad");

        let cred = h.store.get_credential("bad").await.unwrap().unwrap();
        assert!(!cred.active);
        let links = h.store.list_links(&poll.id).await.unwrap();
        let bad = links.iter().find(|l| l.streamer_id == "bad").unwrap();
        assert_eq!(bad.status, LinkStatus::Failed);
        assert!(!h.countdown.is_scheduled(&poll.id));
    }

    #[tokio::test]
    async fn chat_connect_failure_is_recorded() {
        let (h, streamers) = harness(&[("c1", None), ("c2", None)]).await;
        h.chat.refuse.lock().unwrap().insert("c1_tv".into());
        let poll = poll();
        let report = h.provisioner.provision(&poll, &streamers, Instant::now()).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].mode, ModeKind::Chat);
        assert_eq!(report.links[0].streamer_id, "c2");
        assert!(h.countdown.is_scheduled(&poll.id));
    }

    #[tokio::test]
    async fn one_link_per_streamer() {
        let (h, streamers) = harness(&[("c", None)]).await;
        let poll = poll();
        let twice = vec![streamers[0].clone(), streamers[0].clone()];
        let report = h.provisioner.provision(&poll, &twice, Instant::now()).await;
        assert_eq!(report.links.len(), 1);

        let again = h.provisioner.provision(&poll, &streamers, Instant::now()).await;
        assert!(again.links.is_empty());
        assert_eq!(again.failed.len(), 1);
        assert_eq!(h.chat.session_count("c_tv"), 1);
    }
}

//! Poll lifecycle: PENDING → RUNNING → ENDED | CANCELLED.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    pollcast_config::{MessagesConfig, PollsConfig},
    pollcast_counters::{CounterKey, VoteCounterStore},
    serde::Serialize,
    tokio::{
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    aggregate::Aggregate,
    aggregation::Aggregator,
    broadcast::{EventPublisher, PollBroadcaster},
    chat::{ChatKey, ChatVoteChannels},
    countdown::CountdownAnnouncer,
    error::{Error, Result},
    native::NativePollAdapter,
    provider::{ChatConnector, EndPollStatus, NativePollApi, TokenRefresher},
    provisioning::{FailedStreamer, Provisioner},
    store::PollStore,
    types::{ChannelLink, ChannelMode, LinkStatus, MembershipStatus, Poll, PollResult, PollStatus},
};

/// Upper bound on waiting for a stopped aggregation loop to exit.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Time left for the closing countdown line to go out at natural end.
const COUNTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Collaborators of a [`PollController`].
pub struct ControllerDeps {
    pub store: Arc<dyn PollStore>,
    pub native_api: Arc<dyn NativePollApi>,
    pub token_refresher: Arc<dyn TokenRefresher>,
    pub chat_connector: Arc<dyn ChatConnector>,
    pub counters: Arc<dyn VoteCounterStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub polls: PollsConfig,
    pub messages: MessagesConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub poll: Poll,
    pub links: Vec<ChannelLink>,
    pub failed: Vec<FailedStreamer>,
}

/// Current state of a poll as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PollView {
    pub poll: Poll,
    pub links: Vec<ChannelLink>,
    pub aggregate: Aggregate,
    pub result: Option<PollResult>,
}

struct PollRuntime {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollController {
    store: Arc<dyn PollStore>,
    native: Arc<NativePollAdapter>,
    chat: Arc<ChatVoteChannels>,
    counters: Arc<dyn VoteCounterStore>,
    countdown: Arc<CountdownAnnouncer>,
    provisioner: Provisioner,
    aggregator: Aggregator,
    broadcaster: Arc<PollBroadcaster>,
    config: PollsConfig,
    messages: MessagesConfig,
    /// Aggregation loop of every RUNNING poll, by poll id.
    runtimes: std::sync::Mutex<HashMap<String, PollRuntime>>,
    /// Serializes launch, cancel and end of the same poll.
    transitions: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PollController {
    pub fn new(deps: ControllerDeps) -> Arc<Self> {
        let ControllerDeps {
            store,
            native_api,
            token_refresher,
            chat_connector,
            counters,
            publisher,
            polls,
            messages,
        } = deps;

        let native = Arc::new(NativePollAdapter::new(
            native_api,
            token_refresher,
            Arc::clone(&store),
        ));
        let chat = Arc::new(ChatVoteChannels::new(
            chat_connector,
            Arc::clone(&counters),
            Duration::from_millis(polls.chat_line_delay_ms),
        ));
        let countdown = Arc::new(CountdownAnnouncer::new(
            Arc::clone(&chat),
            messages.clone(),
        ));
        let broadcaster = Arc::new(PollBroadcaster::new(publisher, Arc::clone(&store)));
        let provisioner = Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&native),
            Arc::clone(&chat),
            Arc::clone(&counters),
            Arc::clone(&countdown),
            messages.clone(),
            polls.counter_grace_secs,
        );
        let aggregator = Aggregator::new(
            Arc::clone(&store),
            Arc::clone(&native),
            Arc::clone(&counters),
            Arc::clone(&broadcaster),
        );

        Arc::new(Self {
            store,
            native,
            chat,
            counters,
            countdown,
            provisioner,
            aggregator,
            broadcaster,
            config: polls,
            messages,
            runtimes: std::sync::Mutex::new(HashMap::new()),
            transitions: std::sync::Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PollStore> {
        &self.store
    }

    /// Start a PENDING poll on every eligible streamer's channel.
    ///
    /// Streamers come from the campaign's open authorization windows, or from
    /// all active streamers when the poll has no campaign.
    pub async fn launch(self: &Arc<Self>, poll_id: &str) -> Result<LaunchReport> {
        let _transition = self.transition_lock(poll_id).await;
        let launched = self.launch_locked(poll_id).await;
        if launched.is_err() {
            self.forget_transition(poll_id);
        }
        launched
    }

    async fn launch_locked(self: &Arc<Self>, poll_id: &str) -> Result<LaunchReport> {
        let mut poll = self.load(poll_id).await?;
        if poll.status != PollStatus::Pending {
            return Err(Error::invalid_transition(poll_id, poll.status, "launch"));
        }
        poll.validate(self.config.min_duration_secs, self.config.max_duration_secs)?;

        let streamers = match poll.campaign_id.as_deref() {
            Some(campaign_id) => {
                self.store
                    .authorized_streamers(campaign_id, pollcast_common::time::now())
                    .await?
            },
            None => self.store.active_streamers().await?,
        };

        let started = Instant::now();
        poll.status = PollStatus::Running;
        poll.started_at = Some(pollcast_common::time::now());
        self.store.update_poll(&poll).await?;
        info!(
            poll_id = %poll.id,
            campaign_id = poll.campaign_id.as_deref().unwrap_or("-"),
            streamers = streamers.len(),
            duration_secs = poll.duration_secs,
            "poll launched"
        );

        let report = self.provisioner.provision(&poll, &streamers, started).await;
        self.broadcaster.start(&poll).await;

        let deadline = started + Duration::from_secs(u64::from(poll.duration_secs));
        self.spawn_loop(poll.clone(), deadline);

        Ok(LaunchReport {
            poll,
            links: report.links,
            failed: report.failed,
        })
    }

    /// Stop a RUNNING poll early, post the cancelled message in chat and
    /// record `actor` in the result.
    pub async fn cancel(&self, poll_id: &str, actor: Option<&str>) -> Result<PollResult> {
        let _transition = self.transition_lock(poll_id).await;
        let cancelled = self.cancel_locked(poll_id, actor).await;
        self.forget_transition(poll_id);
        cancelled
    }

    async fn cancel_locked(&self, poll_id: &str, actor: Option<&str>) -> Result<PollResult> {
        let poll = self.load(poll_id).await?;
        if poll.status != PollStatus::Running {
            return Err(Error::invalid_transition(poll_id, poll.status, "cancel"));
        }

        // timers stop before any channel is touched
        self.stop_runtime(poll_id).await;
        if self.countdown.is_scheduled(poll_id) {
            self.countdown.cancel_countdown(poll_id);
        }

        let result = self.finalize(poll, true, actor.map(str::to_string)).await?;
        info!(poll_id, actor = actor.unwrap_or("-"), total_votes = result.total_votes, "poll cancelled");
        Ok(result)
    }

    /// Close a RUNNING poll normally. Called by the aggregation loop at the
    /// deadline.
    pub async fn end(&self, poll_id: &str) -> Result<PollResult> {
        let _transition = self.transition_lock(poll_id).await;
        let ended = self.end_locked(poll_id).await;
        self.forget_transition(poll_id);
        ended
    }

    async fn end_locked(&self, poll_id: &str) -> Result<PollResult> {
        let poll = self.load(poll_id).await?;
        if poll.status != PollStatus::Running {
            return Err(Error::invalid_transition(poll_id, poll.status, "end"));
        }

        self.stop_runtime(poll_id).await;
        self.countdown.finish(poll_id, COUNTDOWN_GRACE).await;

        let result = self.finalize(poll, false, None).await?;
        info!(poll_id, total_votes = result.total_votes, winner = ?result.winner_index, "poll ended");
        Ok(result)
    }

    /// Tear down `streamer_id`'s channel in every RUNNING poll of
    /// `campaign_id` and mark the membership as left. Other channels keep
    /// running. Returns the affected poll ids.
    pub async fn remove_streamer(&self, campaign_id: &str, streamer_id: &str) -> Result<Vec<String>> {
        let mut affected = Vec::new();
        for poll in self.store.running_polls(campaign_id).await? {
            let guard = self.aggregator.lock_poll(&poll.id).await;
            // finalized while waiting for the guard
            let still_running = self
                .store
                .get_poll(&poll.id)
                .await?
                .is_some_and(|p| p.status == PollStatus::Running);
            if !still_running {
                drop(guard);
                self.aggregator.forget(&poll.id);
                continue;
            }
            let link = self
                .store
                .list_links(&poll.id)
                .await?
                .into_iter()
                .find(|l| l.streamer_id == streamer_id);
            let Some(link) = link else {
                continue;
            };
            if !link.status.is_terminal() {
                self.close_link(&poll, link, true).await;
            }
            affected.push(poll.id);
        }

        let membership = self
            .store
            .campaign_members(campaign_id)
            .await?
            .into_iter()
            .find(|m| m.streamer_id == streamer_id);
        if let Some(mut membership) = membership {
            membership.status = MembershipStatus::Left;
            membership.authorization = None;
            self.store.upsert_membership(&membership).await?;
        }

        self.broadcaster
            .streamer_left(campaign_id, streamer_id, &affected)
            .await;
        info!(campaign_id, streamer_id, polls = affected.len(), "streamer left campaign");
        Ok(affected)
    }

    /// Stored state of a poll with its current aggregate.
    pub async fn view(&self, poll_id: &str) -> Result<PollView> {
        let poll = self.load(poll_id).await?;
        let links = self.store.list_links(poll_id).await?;
        let aggregate = Aggregate::from_links(&poll, &links);
        let result = self.store.get_result(poll_id).await?;
        Ok(PollView {
            poll,
            links,
            aggregate,
            result,
        })
    }

    #[must_use]
    pub fn is_running(&self, poll_id: &str) -> bool {
        self.runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(poll_id)
    }

    /// Stop every loop and timer and close all chat connections. Polls stay
    /// RUNNING in storage.
    pub async fn shutdown(&self) {
        let runtimes: Vec<_> = self
            .runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (poll_id, runtime) in runtimes {
            runtime.cancel.cancel();
            runtime.task.abort();
            debug!(poll_id = %poll_id, "aggregation loop stopped");
        }
        self.countdown.cancel_all();
        self.chat.close_all().await;
        info!("poll controller stopped");
    }

    fn spawn_loop(self: &Arc<Self>, poll: Poll, deadline: Instant) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let controller = Arc::clone(self);
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let poll_id = poll.id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let expiry = tokio::time::sleep_until(deadline);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = &mut expiry => {
                        // end() waits for this task, so it runs on its own
                        let controller = Arc::clone(&controller);
                        let poll_id = poll.id.clone();
                        tokio::spawn(async move {
                            match controller.end(&poll_id).await {
                                Ok(_) => {},
                                Err(e @ Error::InvalidTransition { .. }) => {
                                    debug!(poll_id = %poll_id, error = %e, "poll already finalized");
                                },
                                Err(e) => warn!(poll_id = %poll_id, error = %e, "failed to end poll"),
                            }
                        });
                        break;
                    },
                    _ = ticker.tick() => {},
                }
                if let Err(e) = controller.aggregator.tick(&poll, &token).await {
                    warn!(poll_id = %poll.id, error = %e, "aggregation tick failed");
                }
            }
        });

        self.runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(poll_id, PollRuntime { cancel, task });
    }

    /// Cancel the loop of `poll_id` and wait for an in-flight tick to finish.
    async fn stop_runtime(&self, poll_id: &str) {
        let runtime = self
            .runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(poll_id);
        let Some(mut runtime) = runtime else {
            return;
        };
        runtime.cancel.cancel();
        if tokio::time::timeout(LOOP_STOP_TIMEOUT, &mut runtime.task)
            .await
            .is_err()
        {
            warn!(poll_id, "aggregation loop did not stop in time, aborting");
            runtime.task.abort();
        }
    }

    /// Final refresh, channel teardown, terminal status, snapshot and end
    /// event, in that order.
    async fn finalize(
        &self,
        mut poll: Poll,
        cancelled: bool,
        actor: Option<String>,
    ) -> Result<PollResult> {
        let links = {
            let _guard = self.aggregator.lock_poll(&poll.id).await;
            let links = self.aggregator.refresh_locked(&poll).await?;
            futures::future::join_all(
                links
                    .into_iter()
                    .map(|link| self.close_link(&poll, link, cancelled)),
            )
            .await
        };
        self.aggregator.forget(&poll.id);

        poll.status = if cancelled {
            PollStatus::Cancelled
        } else {
            PollStatus::Ended
        };
        poll.ended_at = Some(pollcast_common::time::now());
        self.store.update_poll(&poll).await?;

        let aggregate = Aggregate::from_links(&poll, &links);
        let result = PollResult::build(&poll, aggregate.clone(), &links, actor);
        if let Err(e) = self.store.save_result(&result).await {
            warn!(poll_id = %poll.id, error = %e, "failed to save poll result");
        }
        self.broadcaster.end(&poll, &aggregate, cancelled).await;
        Ok(result)
    }

    /// Close one channel and persist its terminal status. Failures are logged;
    /// the link keeps its last known counts.
    async fn close_link(&self, poll: &Poll, mut link: ChannelLink, cancelled: bool) -> ChannelLink {
        if link.status.is_terminal() {
            return link;
        }

        match &link.mode {
            ChannelMode::Native {
                remote_poll_id: Some(remote_id),
            } => {
                let remote_id = remote_id.clone();
                if let Some(votes) = self.end_native(&link.streamer_id, &remote_id).await {
                    link.absorb_counts(&votes);
                }
            },
            ChannelMode::Native {
                remote_poll_id: None,
            } => {},
            ChannelMode::Chat { .. } => {
                let key = ChatKey::new(&link.streamer_id, &poll.id);
                let closing = cancelled.then_some(self.messages.cancelled.as_str());
                self.chat.disconnect(&key, closing).await;
                // votes that landed after the last refresh
                match self
                    .counters
                    .read_all(&CounterKey::new(&poll.id, &link.streamer_id))
                    .await
                {
                    Ok(counts) => {
                        let mut votes = vec![0; poll.options.len()];
                        for (index, n) in counts {
                            if let Some(slot) = votes.get_mut(index) {
                                *slot = n;
                            }
                        }
                        link.absorb_counts(&votes);
                    },
                    Err(e) => {
                        warn!(poll_id = %poll.id, streamer_id = %link.streamer_id, error = %e, "final chat count unavailable");
                    },
                }
            },
        }

        link.set_status(if cancelled {
            LinkStatus::Terminated
        } else {
            LinkStatus::Completed
        });
        if let Err(e) = self.store.update_link(&link).await {
            warn!(poll_id = %poll.id, streamer_id = %link.streamer_id, error = %e, "failed to persist closed channel");
        }
        link
    }

    async fn end_native(&self, streamer_id: &str, remote_id: &str) -> Option<Vec<u64>> {
        let streamer = match self.store.get_streamer(streamer_id).await {
            Ok(Some(streamer)) => streamer,
            Ok(None) => {
                warn!(streamer_id, "streamer missing, native poll left to expire");
                return None;
            },
            Err(e) => {
                warn!(streamer_id, error = %e, "streamer lookup failed");
                return None;
            },
        };
        match self
            .native
            .end_poll(&streamer, remote_id, EndPollStatus::Terminated)
            .await
        {
            Ok(remote) => Some(remote.votes),
            Err(e) => {
                if matches!(e, Error::Unauthorized { .. })
                    && let Err(err) = self.store.deactivate_credential(streamer_id).await
                {
                    warn!(streamer_id, error = %err, "failed to deactivate credential");
                }
                warn!(streamer_id, remote_poll_id = remote_id, error = %e, "failed to end native poll");
                None
            },
        }
    }

    async fn load(&self, poll_id: &str) -> Result<Poll> {
        self.store
            .get_poll(poll_id)
            .await?
            .ok_or_else(|| Error::poll_not_found(poll_id))
    }

    async fn transition_lock(&self, poll_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(transitions.entry(poll_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the transition lock of `poll_id` unless another caller is
    /// waiting on it. Called with the lock held.
    fn forget_transition(&self, poll_id: &str) {
        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        // one reference in the map, one in the caller's guard
        if transitions
            .get(poll_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            transitions.remove(poll_id);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            broadcast::{POLL_END, POLL_START, POLL_UPDATE, STREAMER_LEFT_CAMPAIGN, poll_channel, streamer_channel},
            provider::RemotePollStatus,
            store_memory::InMemoryPollStore,
            testing::{FakeChat, FakeNative, FixedRefresher, RecordingPublisher},
            types::{AuthorizationWindow, CampaignMembership, Streamer, StreamerCredential},
        },
        pollcast_counters::InMemoryCounterStore,
        rstest::rstest,
    };

    struct Harness {
        controller: Arc<PollController>,
        store: Arc<InMemoryPollStore>,
        api: Arc<FakeNative>,
        chat: Arc<FakeChat>,
        publisher: Arc<RecordingPublisher>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryPollStore::new());
        let api = Arc::new(FakeNative::default());
        let chat = Arc::new(FakeChat::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let polls = PollsConfig {
            chat_line_delay_ms: 0,
            ..PollsConfig::default()
        };
        let controller = PollController::new(ControllerDeps {
            store: store.clone(),
            native_api: api.clone(),
            token_refresher: Arc::new(FixedRefresher),
            chat_connector: chat.clone(),
            counters: Arc::new(InMemoryCounterStore::new()),
            publisher: publisher.clone(),
            polls,
            messages: MessagesConfig::default(),
        });
        for (id, tier) in [("n1", Some("partner")), ("c1", None)] {
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
        Harness {
            controller,
            store,
            api,
            chat,
            publisher,
        }
    }

    async fn pending(store: &InMemoryPollStore, campaign: Option<&str>) -> Poll {
        let mut poll = Poll::new("Next map?", vec!["Dust".into(), "Mirage".into()], 30);
        if let Some(campaign) = campaign {
            poll = poll.with_campaign(campaign);
        }
        store.create_poll(&poll).await.unwrap();
        poll
    }

    async fn join(store: &InMemoryPollStore, campaign: &str, streamer: &str) {
        store
            .upsert_membership(&CampaignMembership {
                campaign_id: campaign.into(),
                streamer_id: streamer.into(),
                status: MembershipStatus::Active,
                authorization: Some(AuthorizationWindow::grant(pollcast_common::time::now(), 12)),
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn launch_provisions_and_publishes_start() {
        let h = harness().await;
        let poll = pending(&h.store, None).await;
        let report = h.controller.launch(&poll.id).await.unwrap();

        assert_eq!(report.poll.status, PollStatus::Running);
        assert!(report.poll.started_at.is_some());
        assert_eq!(report.links.len(), 2);
        assert!(report.failed.is_empty());
        assert!(h.controller.is_running(&poll.id));
        assert_eq!(h.publisher.on(&poll_channel(&poll.id), POLL_START).len(), 1);

        // immediate first tick
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.publisher.on(&poll_channel(&poll.id), POLL_UPDATE).len(), 1);
        h.controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_only_reaches_authorized_members() {
        let h = harness().await;
        join(&h.store, "camp", "c1").await;
        let poll = pending(&h.store, Some("camp")).await;
        let report = h.controller.launch(&poll.id).await.unwrap();
        assert_eq!(report.links.len(), 1);
        assert_eq!(report.links[0].streamer_id, "c1");
        assert_eq!(
            h.publisher.on(&streamer_channel("c1"), POLL_START)[0]["campaign_id"],
            "camp"
        );
        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_poll_stays_pending() {
        let h = harness().await;
        let poll = Poll::new("Too short", vec!["A".into(), "B".into()], 5);
        h.store.create_poll(&poll).await.unwrap();
        let err = h.controller.launch(&poll.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPoll { .. }));
        let stored = h.store.get_poll(&poll.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PollStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_poll_is_not_found() {
        let h = harness().await;
        assert!(matches!(
            h.controller.launch("missing").await.unwrap_err(),
            Error::PollNotFound { .. }
        ));
        assert!(matches!(
            h.controller.cancel("missing", None).await.unwrap_err(),
            Error::PollNotFound { .. }
        ));
    }

    #[rstest]
    #[case(PollStatus::Running)]
    #[case(PollStatus::Ended)]
    #[case(PollStatus::Cancelled)]
    #[tokio::test]
    async fn launch_requires_pending(#[case] status: PollStatus) {
        let h = harness().await;
        let mut poll = pending(&h.store, None).await;
        poll.status = status;
        h.store.update_poll(&poll).await.unwrap();
        let err = h.controller.launch(&poll.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { action: "launch", .. }));
        assert!(err.is_hard());
    }

    #[rstest]
    #[case(PollStatus::Pending)]
    #[case(PollStatus::Ended)]
    #[case(PollStatus::Cancelled)]
    #[tokio::test]
    async fn cancel_requires_running(#[case] status: PollStatus) {
        let h = harness().await;
        let mut poll = pending(&h.store, None).await;
        poll.status = status;
        h.store.update_poll(&poll).await.unwrap();
        let err = h.controller.cancel(&poll.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { action: "cancel", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_tears_down_every_channel() {
        let h = harness().await;
        let poll = pending(&h.store, None).await;
        h.controller.launch(&poll.id).await.unwrap();
        h.api.set_votes("b-n1", vec![1, 2]);
        h.chat.say_in("c1", "viewer", "2").await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let result = h.controller.cancel(&poll.id, Some("admin")).await.unwrap();
        assert_eq!(result.status, PollStatus::Cancelled);
        assert_eq!(result.cancelled_by.as_deref(), Some("admin"));
        assert_eq!(result.total_votes, 4);
        assert!(!h.controller.is_running(&poll.id));

        let ended = h.api.ended.lock().unwrap().clone();
        assert_eq!(ended, vec![("remote-b-n1".to_string(), EndPollStatus::Terminated)]);
        let lines = h.chat.lines("c1");
        assert_eq!(lines.last().unwrap(), &MessagesConfig::default().cancelled);
        assert!(h.chat.sender("c1").closed.load(std::sync::atomic::Ordering::SeqCst));

        let links = h.store.list_links(&poll.id).await.unwrap();
        assert!(links.iter().all(|l| l.status == LinkStatus::Terminated));

        let end = h.publisher.on(&poll_channel(&poll.id), POLL_END);
        assert_eq!(end.len(), 1);
        assert_eq!(end[0]["cancelled"], true);
        assert_eq!(end[0]["winner_index"], 1);

        // no countdown line after cancel
        let before = h.chat.lines("c1").len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.chat.lines("c1").len(), before);
        assert!(h.store.get_result(&poll.id).await.unwrap().is_some());

        let again = h.controller.cancel(&poll.id, None).await.unwrap_err();
        assert!(matches!(again, Error::InvalidTransition { status: PollStatus::Cancelled, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_the_poll() {
        let h = harness().await;
        let poll = pending(&h.store, None).await;
        h.controller.launch(&poll.id).await.unwrap();
        h.api.set_votes("b-n1", vec![0, 4]);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let stored = h.store.get_poll(&poll.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PollStatus::Ended);
        let end = h.publisher.on(&poll_channel(&poll.id), POLL_END);
        assert_eq!(end.len(), 1);
        assert_eq!(end[0]["cancelled"], false);
        assert_eq!(end[0]["total_votes"], 4);

        let lines = h.chat.lines("c1");
        assert_eq!(lines.last().unwrap(), &MessagesConfig::default().countdown_closed);
        let links = h.store.list_links(&poll.id).await.unwrap();
        assert!(links.iter().all(|l| l.status == LinkStatus::Completed));

        let err = h.controller.end(&poll.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { action: "end", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn removed_streamer_stops_but_poll_continues() {
        let h = harness().await;
        join(&h.store, "camp", "n1").await;
        join(&h.store, "camp", "c1").await;
        let poll = pending(&h.store, Some("camp")).await;
        h.controller.launch(&poll.id).await.unwrap();
        h.chat.say_in("c1", "viewer", "1").await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let affected = h.controller.remove_streamer("camp", "c1").await.unwrap();
        assert_eq!(affected, vec![poll.id.clone()]);
        assert!(h.controller.is_running(&poll.id));
        assert_eq!(
            h.chat.lines("c1").last().unwrap(),
            &MessagesConfig::default().cancelled
        );

        let left = h.publisher.on(&streamer_channel("c1"), STREAMER_LEFT_CAMPAIGN);
        assert_eq!(left.len(), 1);
        let members = h.store.campaign_members("camp").await.unwrap();
        let c1 = members.iter().find(|m| m.streamer_id == "c1").unwrap();
        assert_eq!(c1.status, MembershipStatus::Left);

        let view = h.controller.view(&poll.id).await.unwrap();
        let link = view.links.iter().find(|l| l.streamer_id == "c1").unwrap();
        assert_eq!(link.status, LinkStatus::Terminated);
        assert_eq!(view.aggregate.total_votes, 1);
        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_transitions_leave_no_lock_behind() {
        let h = harness().await;
        let short = Poll::new("Too short", vec!["A".into(), "B".into()], 5);
        h.store.create_poll(&short).await.unwrap();
        let idle = pending(&h.store, None).await;

        assert!(h.controller.launch(&short.id).await.is_err());
        assert!(h.controller.launch("missing").await.is_err());
        assert!(h.controller.cancel(&idle.id, None).await.is_err());
        assert!(h.controller.transitions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_skips_a_poll_finalized_while_it_waited() {
        let h = harness().await;
        join(&h.store, "camp", "c1").await;
        let poll = pending(&h.store, Some("camp")).await;
        h.controller.launch(&poll.id).await.unwrap();
        h.controller.stop_runtime(&poll.id).await;

        let guard = h.controller.aggregator.lock_poll(&poll.id).await;
        let controller = Arc::clone(&h.controller);
        let removal = tokio::spawn(async move { controller.remove_streamer("camp", "c1").await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut ended = h.store.get_poll(&poll.id).await.unwrap().unwrap();
        ended.status = PollStatus::Ended;
        h.store.update_poll(&ended).await.unwrap();
        drop(guard);
        h.controller.aggregator.forget(&poll.id);

        let affected = removal.await.unwrap().unwrap();
        assert!(affected.is_empty());
        assert_eq!(h.controller.aggregator.tracked_polls(), 0);
        let links = h.store.list_links(&poll.id).await.unwrap();
        assert_eq!(links[0].status, LinkStatus::Running);
        h.controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_completion_is_kept_at_end() {
        let h = harness().await;
        let poll = pending(&h.store, None).await;
        h.controller.launch(&poll.id).await.unwrap();
        h.api
            .status
            .lock()
            .unwrap()
            .insert("b-n1".into(), RemotePollStatus::Completed);
        tokio::time::sleep(Duration::from_secs(31)).await;
        // already completed remotely, nothing to end
        assert!(h.api.ended.lock().unwrap().is_empty());
    }
}

//! In-memory poll store for tests and ephemeral runs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    error::{Context, Error, Result},
    store::PollStore,
    types::{
        AuthorizationWindow, CampaignMembership, ChannelLink, MembershipStatus, Poll, PollResult,
        PollStatus, Streamer, StreamerCredential,
    },
};

#[derive(Default)]
struct State {
    polls: HashMap<String, Poll>,
    /// poll id -> streamer id -> link
    links: HashMap<String, BTreeMap<String, ChannelLink>>,
    streamers: BTreeMap<String, Streamer>,
    credentials: HashMap<String, StreamerCredential>,
    /// (campaign id, streamer id) -> membership
    memberships: BTreeMap<(String, String), CampaignMembership>,
    results: HashMap<String, PollResult>,
}

impl State {
    fn has_active_credential(&self, streamer_id: &str) -> bool {
        self.credentials
            .get(streamer_id)
            .is_some_and(|c| c.active)
    }
}

#[derive(Default)]
pub struct InMemoryPollStore {
    state: Mutex<State>,
}

impl InMemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PollStore for InMemoryPollStore {
    async fn create_poll(&self, poll: &Poll) -> Result<()> {
        let mut state = self.lock();
        if state.polls.contains_key(&poll.id) {
            return Err(Error::Duplicate {
                what: format!("poll {}", poll.id),
            });
        }
        state.polls.insert(poll.id.clone(), poll.clone());
        Ok(())
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>> {
        Ok(self.lock().polls.get(poll_id).cloned())
    }

    async fn update_poll(&self, poll: &Poll) -> Result<()> {
        let mut state = self.lock();
        match state.polls.get_mut(&poll.id) {
            Some(stored) => {
                *stored = poll.clone();
                Ok(())
            },
            None => Err(Error::poll_not_found(&poll.id)),
        }
    }

    async fn running_polls(&self, campaign_id: &str) -> Result<Vec<Poll>> {
        Ok(self
            .lock()
            .polls
            .values()
            .filter(|p| {
                p.status == PollStatus::Running && p.campaign_id.as_deref() == Some(campaign_id)
            })
            .cloned()
            .collect())
    }

    async fn insert_link(&self, link: &ChannelLink) -> Result<()> {
        let mut state = self.lock();
        let links = state.links.entry(link.poll_id.clone()).or_default();
        if links.contains_key(&link.streamer_id) {
            return Err(Error::Duplicate {
                what: format!(
                    "channel link for streamer {} on poll {}",
                    link.streamer_id, link.poll_id
                ),
            });
        }
        links.insert(link.streamer_id.clone(), link.clone());
        Ok(())
    }

    async fn update_link(&self, link: &ChannelLink) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .links
            .get_mut(&link.poll_id)
            .and_then(|links| links.get_mut(&link.streamer_id))
            .with_context(|| format!("channel link not found: {}", link.id))?;
        *stored = link.clone();
        Ok(())
    }

    async fn list_links(&self, poll_id: &str) -> Result<Vec<ChannelLink>> {
        Ok(self
            .lock()
            .links
            .get(poll_id)
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_streamer(&self, streamer: &Streamer) -> Result<()> {
        self.lock()
            .streamers
            .insert(streamer.id.clone(), streamer.clone());
        Ok(())
    }

    async fn get_streamer(&self, streamer_id: &str) -> Result<Option<Streamer>> {
        Ok(self.lock().streamers.get(streamer_id).cloned())
    }

    async fn active_streamers(&self) -> Result<Vec<Streamer>> {
        let state = self.lock();
        Ok(state
            .streamers
            .values()
            .filter(|s| s.active && state.has_active_credential(&s.id))
            .cloned()
            .collect())
    }

    async fn get_credential(&self, streamer_id: &str) -> Result<Option<StreamerCredential>> {
        Ok(self.lock().credentials.get(streamer_id).cloned())
    }

    async fn save_credential(&self, credential: &StreamerCredential) -> Result<()> {
        self.lock()
            .credentials
            .insert(credential.streamer_id.clone(), credential.clone());
        Ok(())
    }

    async fn deactivate_credential(&self, streamer_id: &str) -> Result<()> {
        if let Some(cred) = self.lock().credentials.get_mut(streamer_id) {
            cred.active = false;
            cred.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn upsert_membership(&self, membership: &CampaignMembership) -> Result<()> {
        self.lock().memberships.insert(
            (
                membership.campaign_id.clone(),
                membership.streamer_id.clone(),
            ),
            membership.clone(),
        );
        Ok(())
    }

    async fn campaign_members(&self, campaign_id: &str) -> Result<Vec<CampaignMembership>> {
        Ok(self
            .lock()
            .memberships
            .values()
            .filter(|m| m.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn grant_authorization(
        &self,
        campaign_id: &str,
        streamer_id: &str,
        window: AuthorizationWindow,
    ) -> Result<()> {
        let mut state = self.lock();
        let membership = state
            .memberships
            .get_mut(&(campaign_id.to_string(), streamer_id.to_string()))
            .ok_or_else(|| {
                Error::message(format!(
                    "streamer {streamer_id} is not a member of campaign {campaign_id}"
                ))
            })?;
        membership.authorization = Some(window);
        Ok(())
    }

    async fn revoke_authorization(&self, campaign_id: &str, streamer_id: &str) -> Result<()> {
        if let Some(membership) = self
            .lock()
            .memberships
            .get_mut(&(campaign_id.to_string(), streamer_id.to_string()))
        {
            membership.authorization = None;
        }
        Ok(())
    }

    async fn authorized_streamers(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Streamer>> {
        let state = self.lock();
        Ok(state
            .memberships
            .values()
            .filter(|m| {
                m.campaign_id == campaign_id
                    && m.status == MembershipStatus::Active
                    && m.authorization.is_some_and(|w| w.is_active(now))
            })
            .filter_map(|m| state.streamers.get(&m.streamer_id))
            .filter(|s| s.active && state.has_active_credential(&s.id))
            .cloned()
            .collect())
    }

    async fn save_result(&self, result: &PollResult) -> Result<()> {
        self.lock()
            .results
            .insert(result.poll_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result(&self, poll_id: &str) -> Result<Option<PollResult>> {
        Ok(self.lock().results.get(poll_id).cloned())
    }
}

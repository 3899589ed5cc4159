use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    error::Result,
    types::{
        AuthorizationWindow, CampaignMembership, ChannelLink, Poll, PollResult, Streamer,
        StreamerCredential,
    },
};

/// Persistence for polls, channel links, streamers and their credentials.
///
/// Calls are independent; no cross-call transaction is assumed.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn create_poll(&self, poll: &Poll) -> Result<()>;
    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>>;
    async fn update_poll(&self, poll: &Poll) -> Result<()>;
    /// RUNNING polls belonging to `campaign_id`.
    async fn running_polls(&self, campaign_id: &str) -> Result<Vec<Poll>>;

    /// Insert a link. Fails with `Error::Duplicate` when the poll already has
    /// a link for that streamer.
    async fn insert_link(&self, link: &ChannelLink) -> Result<()>;
    async fn update_link(&self, link: &ChannelLink) -> Result<()>;
    async fn list_links(&self, poll_id: &str) -> Result<Vec<ChannelLink>>;

    async fn upsert_streamer(&self, streamer: &Streamer) -> Result<()>;
    async fn get_streamer(&self, streamer_id: &str) -> Result<Option<Streamer>>;
    /// Active streamers with an active credential.
    async fn active_streamers(&self) -> Result<Vec<Streamer>>;

    async fn get_credential(&self, streamer_id: &str) -> Result<Option<StreamerCredential>>;
    async fn save_credential(&self, credential: &StreamerCredential) -> Result<()>;
    async fn deactivate_credential(&self, streamer_id: &str) -> Result<()>;

    async fn upsert_membership(&self, membership: &CampaignMembership) -> Result<()>;
    async fn campaign_members(&self, campaign_id: &str) -> Result<Vec<CampaignMembership>>;
    /// Open (or renew) the launch window of an existing membership.
    async fn grant_authorization(
        &self,
        campaign_id: &str,
        streamer_id: &str,
        window: AuthorizationWindow,
    ) -> Result<()>;
    async fn revoke_authorization(&self, campaign_id: &str, streamer_id: &str) -> Result<()>;
    /// Active members of `campaign_id` whose window is open at `now` and who
    /// hold an active streamer record and credential.
    async fn authorized_streamers(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Streamer>>;

    async fn save_result(&self, result: &PollResult) -> Result<()>;
    async fn get_result(&self, poll_id: &str) -> Result<Option<PollResult>>;
}

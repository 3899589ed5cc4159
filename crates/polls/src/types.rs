//! Poll domain model.

use std::{collections::BTreeMap, fmt, str::FromStr};

use {
    chrono::{DateTime, Duration, Utc},
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use crate::{
    aggregate::Aggregate,
    error::{Error, Result},
};

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
    Pending,
    Running,
    Ended,
    Cancelled,
}

impl PollStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Ended => "ENDED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "ENDED" => Ok(Self::Ended),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(Error::message(format!("unknown poll status: {other}"))),
        }
    }
}

/// One logical vote, run on many channels at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub campaign_id: Option<String>,
    pub question: String,
    pub options: Vec<String>,
    pub duration_secs: u32,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Poll {
    /// A fresh PENDING poll.
    pub fn new(question: impl Into<String>, options: Vec<String>, duration_secs: u32) -> Self {
        Self {
            id: pollcast_common::new_id(),
            campaign_id: None,
            question: question.into(),
            options,
            duration_secs,
            status: PollStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[must_use]
    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    /// Scheduled end, once the poll has started.
    #[must_use]
    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|start| pollcast_common::time::add_secs(start, u64::from(self.duration_secs)))
    }

    /// Check launch preconditions on content: question, option count and
    /// duration bounds.
    pub fn validate(&self, min_duration_secs: u32, max_duration_secs: u32) -> Result<()> {
        if self.question.trim().is_empty() {
            return Err(Error::invalid_poll("question is empty"));
        }
        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&self.options.len()) {
            return Err(Error::invalid_poll(format!(
                "a poll needs {MIN_OPTIONS} to {MAX_OPTIONS} options, got {}",
                self.options.len()
            )));
        }
        if let Some(i) = self.options.iter().position(|o| o.trim().is_empty()) {
            return Err(Error::invalid_poll(format!("option {} is empty", i + 1)));
        }
        if !(min_duration_secs..=max_duration_secs).contains(&self.duration_secs) {
            return Err(Error::invalid_poll(format!(
                "duration must be between {min_duration_secs}s and {max_duration_secs}s, got {}s",
                self.duration_secs
            )));
        }
        Ok(())
    }
}

/// How votes reach a channel link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChannelMode {
    /// Provider-side poll. `remote_poll_id` is absent only when creation failed.
    Native { remote_poll_id: Option<String> },
    /// Numeric votes parsed from the streamer's chat.
    Chat { channel_login: String },
}

impl ChannelMode {
    #[must_use]
    pub fn kind(&self) -> ModeKind {
        match self {
            Self::Native { .. } => ModeKind::Native,
            Self::Chat { .. } => ModeKind::Chat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeKind {
    Native,
    Chat,
}

impl ModeKind {
    /// Native polling needs a monetized provider account.
    #[must_use]
    pub fn for_broadcaster_type(broadcaster_type: Option<&str>) -> Self {
        match broadcaster_type.map(str::to_ascii_lowercase).as_deref() {
            Some("affiliate" | "partner") => Self::Native,
            _ => Self::Chat,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "NATIVE",
            Self::Chat => "CHAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Created,
    Running,
    Completed,
    Terminated,
    Failed,
}

impl LinkStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for LinkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "TERMINATED" => Ok(Self::Terminated),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::message(format!("unknown link status: {other}"))),
        }
    }
}

/// The per-streamer side of a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub id: String,
    pub poll_id: String,
    pub streamer_id: String,
    #[serde(flatten)]
    pub mode: ChannelMode,
    pub status: LinkStatus,
    /// Vote count per option, in poll option order.
    pub votes: Vec<u64>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelLink {
    pub fn new(
        poll: &Poll,
        streamer_id: impl Into<String>,
        mode: ChannelMode,
        status: LinkStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: pollcast_common::new_id(),
            poll_id: poll.id.clone(),
            streamer_id: streamer_id.into(),
            mode,
            status,
            votes: vec![0; poll.options.len()],
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A link recording that this streamer could not be provisioned.
    pub fn failed(
        poll: &Poll,
        streamer_id: impl Into<String>,
        mode: ChannelMode,
        reason: impl Into<String>,
    ) -> Self {
        let mut link = Self::new(poll, streamer_id, mode, LinkStatus::Failed);
        link.failure = Some(reason.into());
        link
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.votes.iter().sum()
    }

    /// Take freshly fetched counts without ever lowering a stored count.
    /// Returns whether anything changed.
    pub fn absorb_counts(&mut self, fresh: &[u64]) -> bool {
        let mut changed = false;
        for (slot, &n) in self.votes.iter_mut().zip(fresh) {
            if n > *slot {
                *slot = n;
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    pub fn set_status(&mut self, status: LinkStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    #[must_use]
    pub fn remote_poll_id(&self) -> Option<&str> {
        match &self.mode {
            ChannelMode::Native { remote_poll_id } => remote_poll_id.as_deref(),
            ChannelMode::Chat { .. } => None,
        }
    }
}

/// A streaming account that polls can run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streamer {
    pub id: String,
    /// Provider login, also the chat channel name.
    pub login: String,
    pub display_name: String,
    /// Provider-side user id (the broadcaster id for native poll calls).
    pub provider_user_id: String,
    /// Provider account tier: "partner", "affiliate" or empty.
    pub broadcaster_type: Option<String>,
    pub active: bool,
}

impl Streamer {
    #[must_use]
    pub fn eligible_mode(&self) -> ModeKind {
        ModeKind::for_broadcaster_type(self.broadcaster_type.as_deref())
    }
}

/// Provider token pair of a streamer. Stored encrypted.
#[derive(Debug, Clone)]
pub struct StreamerCredential {
    pub streamer_id: String,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub scopes: Vec<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl StreamerCredential {
    pub fn new(
        streamer_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            streamer_id: streamer_id.into(),
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            scopes: Vec::new(),
            active: true,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    Invited,
    Active,
    Left,
}

impl MembershipStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invited => "INVITED",
            Self::Active => "ACTIVE",
            Self::Left => "LEFT",
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INVITED" => Ok(Self::Invited),
            "ACTIVE" => Ok(Self::Active),
            "LEFT" => Ok(Self::Left),
            other => Err(Error::message(format!("unknown membership status: {other}"))),
        }
    }
}

/// Time-boxed consent for a campaign owner to launch polls on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationWindow {
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationWindow {
    #[must_use]
    pub fn grant(now: DateTime<Utc>, hours: u32) -> Self {
        Self {
            granted_at: now,
            expires_at: now + Duration::hours(i64::from(hours)),
        }
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Time left, or `None` once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.is_active(now).then(|| self.expires_at - now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMembership {
    pub campaign_id: String,
    pub streamer_id: String,
    pub status: MembershipStatus,
    pub authorization: Option<AuthorizationWindow>,
}

/// One channel's contribution to a finished poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub streamer_id: String,
    pub mode: ModeKind,
    pub status: LinkStatus,
    pub votes: Vec<u64>,
}

impl From<&ChannelLink> for ChannelSnapshot {
    fn from(link: &ChannelLink) -> Self {
        Self {
            streamer_id: link.streamer_id.clone(),
            mode: link.mode.kind(),
            status: link.status,
            votes: link.votes.clone(),
        }
    }
}

/// Final snapshot persisted when a poll ends or is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub poll_id: String,
    pub campaign_id: Option<String>,
    pub status: PollStatus,
    pub total_votes: u64,
    /// Keyed by option label. Duplicate labels are summed.
    pub votes_by_option: BTreeMap<String, u64>,
    pub aggregate: Aggregate,
    pub winner_index: Option<usize>,
    pub channels: Vec<ChannelSnapshot>,
    pub ended_at: DateTime<Utc>,
    pub cancelled: bool,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl PollResult {
    pub fn build(
        poll: &Poll,
        aggregate: Aggregate,
        links: &[ChannelLink],
        cancelled_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let cancelled = poll.status == PollStatus::Cancelled;
        Self {
            poll_id: poll.id.clone(),
            campaign_id: poll.campaign_id.clone(),
            status: poll.status,
            total_votes: aggregate.total_votes,
            votes_by_option: aggregate.votes_by_label(),
            winner_index: aggregate.winner_index(),
            aggregate,
            channels: links.iter().map(ChannelSnapshot::from).collect(),
            ended_at: poll.ended_at.unwrap_or(now),
            cancelled,
            cancelled_by: if cancelled { cancelled_by } else { None },
            cancelled_at: cancelled.then(|| poll.ended_at.unwrap_or(now)),
        }
    }
}

//! Seams to the streaming provider: native poll API, token refresh and chat.
//!
//! Concrete bindings live in `pollcast-twitch`; tests script these traits.

use std::sync::Arc;

use {
    async_trait::async_trait,
    secrecy::Secret,
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio::sync::mpsc,
};

use crate::types::LinkStatus;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The access token was rejected.
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Identity used for one provider call.
#[derive(Debug, Clone)]
pub struct ProviderAuth {
    pub broadcaster_id: String,
    pub access_token: Secret<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePollRequest {
    pub title: String,
    pub choices: Vec<String>,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemotePollStatus {
    Active,
    Completed,
    Archived,
    Terminated,
    Moderated,
    Invalid,
    Unknown(String),
}

impl RemotePollStatus {
    #[must_use]
    pub fn from_provider(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "COMPLETED" => Self::Completed,
            "ARCHIVED" => Self::Archived,
            "TERMINATED" => Self::Terminated,
            "MODERATED" => Self::Moderated,
            "INVALID" => Self::Invalid,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    #[must_use]
    pub fn link_status(&self) -> LinkStatus {
        match self {
            Self::Active => LinkStatus::Running,
            Self::Completed | Self::Archived => LinkStatus::Completed,
            Self::Terminated | Self::Moderated | Self::Invalid => LinkStatus::Terminated,
            Self::Unknown(_) => LinkStatus::Created,
        }
    }
}

/// A provider-side poll as last reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePoll {
    pub id: String,
    pub status: RemotePollStatus,
    /// Votes per choice, in creation order.
    pub votes: Vec<u64>,
}

/// Terminal status requested when ending a provider poll early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndPollStatus {
    /// Ends the poll and keeps it visible.
    Terminated,
    /// Ends the poll and hides it.
    Archived,
}

impl EndPollStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminated => "TERMINATED",
            Self::Archived => "ARCHIVED",
        }
    }
}

#[async_trait]
pub trait NativePollApi: Send + Sync {
    async fn create_poll(
        &self,
        auth: &ProviderAuth,
        request: &CreatePollRequest,
    ) -> ProviderResult<RemotePoll>;

    async fn get_poll(&self, auth: &ProviderAuth, remote_id: &str) -> ProviderResult<RemotePoll>;

    async fn end_poll(
        &self,
        auth: &ProviderAuth,
        remote_id: &str,
        status: EndPollStatus,
    ) -> ProviderResult<RemotePoll>;
}

/// Result of a successful refresh-token grant.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub scopes: Vec<String>,
    pub expires_in: Option<u64>,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange `refresh_token` for a new pair. A rejected refresh token is
    /// reported as [`ProviderError::Unauthorized`].
    async fn refresh(&self, refresh_token: &Secret<String>) -> ProviderResult<TokenPair>;
}

/// Who a chat connection speaks as, and where.
#[derive(Debug, Clone)]
pub struct ChatIdentity {
    pub login: String,
    pub access_token: Secret<String>,
    /// Channel to join, without the leading `#`.
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChatMessage {
    pub sender_login: String,
    pub text: String,
    /// Authored by the connection's own identity.
    pub is_self: bool,
}

#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Post one line to the joined channel.
    async fn say(&self, text: &str) -> ProviderResult<()>;

    /// Leave the channel and release the connection.
    async fn close(&self) -> ProviderResult<()>;
}

/// A live chat connection: an outbound handle and the inbound message stream.
pub struct ChatSession {
    pub sender: Arc<dyn ChatSender>,
    pub inbound: mpsc::Receiver<InboundChatMessage>,
}

#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn connect(&self, identity: ChatIdentity) -> ProviderResult<ChatSession>;
}

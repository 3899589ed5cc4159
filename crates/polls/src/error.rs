use thiserror::Error;

use crate::{provider::ProviderError, types::PollStatus};

#[derive(Debug, Error)]
pub enum Error {
    /// Lifecycle operation attempted from the wrong state.
    #[error("cannot {action} poll {poll_id} while it is {status}")]
    InvalidTransition {
        poll_id: String,
        status: PollStatus,
        action: &'static str,
    },

    #[error("poll not found: {poll_id}")]
    PollNotFound { poll_id: String },

    #[error("invalid poll: {message}")]
    InvalidPoll { message: String },

    /// The provider rejected the credential even after a token refresh.
    #[error("streamer {streamer_id} is not authorized by the provider")]
    Unauthorized { streamer_id: String },

    #[error("failed to provision channel for streamer {streamer_id}: {message}")]
    ChannelProvisioning {
        streamer_id: String,
        message: String,
    },

    #[error("failed to refresh counts for streamer {streamer_id}: {message}")]
    AggregationFetch {
        streamer_id: String,
        message: String,
    },

    #[error("{what} already exists")]
    Duplicate { what: String },

    #[error("crypto error: {message}")]
    Crypto { message: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{context}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_transition(
        poll_id: impl Into<String>,
        status: PollStatus,
        action: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            poll_id: poll_id.into(),
            status,
            action,
        }
    }

    #[must_use]
    pub fn poll_not_found(poll_id: impl Into<String>) -> Self {
        Self::PollNotFound {
            poll_id: poll_id.into(),
        }
    }

    #[must_use]
    pub fn invalid_poll(message: impl Into<String>) -> Self {
        Self::InvalidPoll {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn provisioning(streamer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelProvisioning {
            streamer_id: streamer_id.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn aggregation_fetch(streamer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AggregationFetch {
            streamer_id: streamer_id.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error must reach the caller instead of degrading into a
    /// logged, partial result.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::PollNotFound { .. } | Self::InvalidPoll { .. }
        )
    }
}

impl pollcast_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pollcast_common::impl_context!();

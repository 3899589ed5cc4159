use {pollcast_polls::provider::ProviderError, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error("twitch.client_id is not configured")]
    MissingClientId,

    #[error("twitch.client_secret is not configured")]
    MissingClientSecret,

    /// The chat server refused the login.
    #[error("chat login rejected: {notice}")]
    LoginRejected { notice: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

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
}

impl pollcast_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

impl From<Error> for ProviderError {
    fn from(err: Error) -> Self {
        match err {
            Error::LoginRejected { .. } => Self::Unauthorized,
            Error::Http(e) if e.is_decode() => Self::Decode(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pollcast_common::impl_context!();

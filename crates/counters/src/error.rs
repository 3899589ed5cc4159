use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The shared counter service could not serve the request.
    #[error("counter store unavailable: {message}")]
    Unavailable { message: String },

    #[error("counter store timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("{context}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
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

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::external(format!("redis command failed: {err}"), err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

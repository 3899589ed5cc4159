//! Semantic validation of a loaded configuration.

use {base64::Engine, secrecy::ExposeSecret};

use crate::schema::PollcastConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "polls.max_duration_secs"
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Check a config for values that would prevent the service from running
/// correctly.
#[must_use]
pub fn validate(config: &PollcastConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.server.port == 0 {
        result.push(Severity::Error, "server.port", "port must be non-zero");
    }

    let polls = &config.polls;
    if polls.tick_interval_ms == 0 {
        result.push(
            Severity::Error,
            "polls.tick_interval_ms",
            "tick interval must be positive",
        );
    }
    if polls.min_duration_secs > polls.max_duration_secs {
        result.push(
            Severity::Error,
            "polls.min_duration_secs",
            format!(
                "minimum duration {}s exceeds maximum {}s",
                polls.min_duration_secs, polls.max_duration_secs
            ),
        );
    }
    if polls.authorization_window_hours == 0 {
        result.push(
            Severity::Warning,
            "polls.authorization_window_hours",
            "a zero-hour window makes every authorization expire immediately",
        );
    }

    match &config.security.token_key {
        Some(key) => {
            let decoded = base64::engine::general_purpose::STANDARD.decode(key.expose_secret());
            if decoded.map(|k| k.len()).ok() != Some(32) {
                result.push(
                    Severity::Error,
                    "security.token_key",
                    "token key must be 32 bytes encoded as base64",
                );
            }
        },
        None => result.push(
            Severity::Warning,
            "security.token_key",
            "no token key set, provider tokens are stored with an ephemeral key",
        ),
    }

    if config.twitch.client_id.as_deref().is_none_or(str::is_empty) {
        result.push(
            Severity::Warning,
            "twitch.client_id",
            "no client id, provider calls will be rejected",
        );
    }
    if let Some(id) = &config.twitch.client_id
        && id.starts_with("${")
    {
        result.push(
            Severity::Warning,
            "twitch.client_id",
            format!("unresolved environment placeholder {id}"),
        );
    }

    if config.redis.connection_url().is_none() {
        result.push(
            Severity::Warning,
            "redis.url",
            "no redis configured, vote counters are kept in process memory only",
        );
    }

    result
}

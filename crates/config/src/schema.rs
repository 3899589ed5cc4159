//! Config schema for the pollcast service.

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollcastConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub twitch: TwitchConfig,
    pub polls: PollsConfig,
    pub messages: MessagesConfig,
    pub security: SecurityConfig,
}

impl PollcastConfig {
    /// Copy of this config with every secret replaced by a placeholder,
    /// suitable for printing.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |s: &Option<Secret<String>>| s.as_ref().map(|_| Secret::new(REDACTED.into()));
        copy.twitch.client_secret = mask(&self.twitch.client_secret);
        copy.redis.password = mask(&self.redis.password);
        copy.security.token_key = mask(&self.security.token_key);
        if let Some(url) = &self.redis.url
            && url.contains('@')
        {
            copy.redis.url = Some(REDACTED.into());
        }
        copy
    }
}

const REDACTED: &str = "[REDACTED]";

/// HTTP/WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection string.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://pollcast.db?mode=rwc".into(),
        }
    }
}

/// Shared vote counter service. With neither `url` nor `host` set the
/// service runs on the in-process counter map alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<Secret<String>>,
    pub db: u8,
    /// Namespace prepended to every counter key.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "pollcast".into(),
        }
    }
}

impl RedisConfig {
    /// Connection URL built from `url`, or from the discrete host fields.
    #[must_use]
    pub fn connection_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.to_string());
        }
        let host = self.host.as_deref().filter(|h| !h.trim().is_empty())?;
        let auth = self
            .password
            .as_ref()
            .map(|p| format!(":{}@", p.expose_secret()))
            .unwrap_or_default();
        Some(format!("redis://{auth}{host}:{}/{}", self.port, self.db))
    }
}

/// Provider application credentials and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub client_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<Secret<String>>,
    pub api_base_url: String,
    pub token_url: String,
    pub chat_url: String,
    /// HTTP timeout for provider calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            api_base_url: "https://api.twitch.tv/helix".into(),
            token_url: "https://id.twitch.tv/oauth2/token".into(),
            chat_url: "wss://irc-ws.chat.twitch.tv:443".into(),
            request_timeout_secs: 10,
        }
    }
}

/// Poll engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollsConfig {
    pub tick_interval_ms: u64,
    /// Extra lifetime given to chat vote counters beyond the poll duration.
    pub counter_grace_secs: u64,
    /// Pause between consecutive lines of a multi-line chat message.
    pub chat_line_delay_ms: u64,
    pub min_duration_secs: u32,
    pub max_duration_secs: u32,
    /// Lifetime of a streamer's launch authorization for a campaign.
    pub authorization_window_hours: u32,
}

impl Default for PollsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3_000,
            counter_grace_secs: 300,
            chat_line_delay_ms: 50,
            min_duration_secs: 15,
            max_duration_secs: 1_800,
            authorization_window_hours: 12,
        }
    }
}

/// Chat texts posted by the chat vote channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub countdown_ten: String,
    pub countdown_closed: String,
    pub cancelled: String,
    /// `{duration}` is replaced with the poll duration in seconds.
    pub poll_header: String,
    /// `{choices}` is replaced with the comma separated option numbers.
    pub vote_hint: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            countdown_ten: "⏰ Plus que 10 secondes pour voter !".into(),
            countdown_closed: "🔒 Sondage clôturé ! Merci pour vos votes 🎉".into(),
            cancelled: "❌ Sondage annulé".into(),
            poll_header: "🎮 SONDAGE - {duration} secondes".into(),
            vote_hint: "Votez en tapant {choices} !".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Base64 encoded 32-byte key protecting stored provider tokens.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub token_key: Option<Secret<String>>,
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

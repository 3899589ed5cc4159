//! Production wiring of the poll controller's collaborators.

use std::sync::Arc;

use {
    anyhow::Context,
    pollcast_config::PollcastConfig,
    pollcast_counters::{FallbackCounterStore, RedisCounterStore, VoteCounterStore},
    pollcast_polls::{
        PollController, controller::ControllerDeps, crypto::TokenCipher,
        store_sqlite::SqlitePollStore,
    },
    pollcast_twitch::{HelixClient, IrcChatConnector, TwitchTokenRefresher},
    secrecy::ExposeSecret,
    tracing::{info, warn},
};

use crate::{broadcast::Broadcaster, state::AppState};

/// Token cipher from `security.token_key`. Without a key, tokens are sealed
/// with a key that only lives as long as the process.
pub fn token_cipher(config: &PollcastConfig) -> anyhow::Result<TokenCipher> {
    match &config.security.token_key {
        Some(key) => TokenCipher::from_base64(key.expose_secret())
            .context("security.token_key is not a base64 encoded 32-byte key"),
        None => {
            warn!("security.token_key not set, stored tokens will not survive a restart");
            Ok(TokenCipher::ephemeral())
        },
    }
}

/// Redis-backed counters with in-process fallback, or process memory alone
/// when no Redis is configured or it cannot be reached at startup.
pub async fn counter_store(config: &PollcastConfig) -> Arc<dyn VoteCounterStore> {
    let Some(url) = config.redis.connection_url() else {
        info!("no redis configured, vote counters kept in process memory");
        return Arc::new(FallbackCounterStore::local_only());
    };
    match RedisCounterStore::connect(&url, config.redis.key_prefix.clone()).await {
        Ok(redis) => {
            info!(prefix = %config.redis.key_prefix, "vote counters on redis");
            Arc::new(FallbackCounterStore::new(Arc::new(redis)))
        },
        Err(e) => {
            warn!(error = %e, "redis unavailable, vote counters kept in process memory");
            Arc::new(FallbackCounterStore::local_only())
        },
    }
}

/// Open the store, connect the counters and build the controller.
pub async fn build_state(config: &PollcastConfig) -> anyhow::Result<AppState> {
    let cipher = Arc::new(token_cipher(config)?);
    let store = SqlitePollStore::new(&config.database.url, cipher)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    let counters = counter_store(config).await;

    let helix = HelixClient::new(&config.twitch).context("twitch.client_id is required to serve")?;
    let refresher = TwitchTokenRefresher::new(&config.twitch)
        .context("twitch.client_id and twitch.client_secret are required to serve")?;
    let chat = IrcChatConnector::new(&config.twitch);

    let broadcaster = Arc::new(Broadcaster::new());
    let controller = PollController::new(ControllerDeps {
        store: Arc::new(store),
        native_api: Arc::new(helix),
        token_refresher: Arc::new(refresher),
        chat_connector: Arc::new(chat),
        counters,
        publisher: broadcaster.clone(),
        polls: config.polls.clone(),
        messages: config.messages.clone(),
    });
    Ok(AppState::new(controller, broadcaster))
}

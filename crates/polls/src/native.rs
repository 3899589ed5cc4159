//! Provider poll calls with transparent token refresh.

use std::{collections::HashMap, future::Future, sync::Arc};

use {
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    provider::{
        CreatePollRequest, EndPollStatus, NativePollApi, ProviderAuth, ProviderError,
        ProviderResult, RemotePoll, TokenRefresher,
    },
    store::PollStore,
    types::{Poll, Streamer, StreamerCredential},
};

/// Wraps [`NativePollApi`] so that an expired access token is refreshed once,
/// persisted, and the call retried once.
///
/// Refreshes are serialized per streamer: concurrent callers that hit the
/// same expired token wait for the first refresh and reuse its result.
pub struct NativePollAdapter {
    api: Arc<dyn NativePollApi>,
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn PollStore>,
    refresh_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NativePollAdapter {
    pub fn new(
        api: Arc<dyn NativePollApi>,
        refresher: Arc<dyn TokenRefresher>,
        store: Arc<dyn PollStore>,
    ) -> Self {
        Self {
            api,
            refresher,
            store,
            refresh_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_poll(&self, streamer: &Streamer, poll: &Poll) -> Result<RemotePoll> {
        let request = CreatePollRequest {
            title: poll.question.clone(),
            choices: poll.options.clone(),
            duration_secs: poll.duration_secs,
        };
        let remote = self
            .call(streamer, |auth| {
                let api = Arc::clone(&self.api);
                let request = request.clone();
                async move { api.create_poll(&auth, &request).await }
            })
            .await?;
        info!(
            poll_id = %poll.id,
            streamer_id = %streamer.id,
            remote_poll_id = %remote.id,
            "native poll created"
        );
        Ok(remote)
    }

    pub async fn get_poll(&self, streamer: &Streamer, remote_id: &str) -> Result<RemotePoll> {
        self.call(streamer, |auth| {
            let api = Arc::clone(&self.api);
            let remote_id = remote_id.to_string();
            async move { api.get_poll(&auth, &remote_id).await }
        })
        .await
    }

    pub async fn end_poll(
        &self,
        streamer: &Streamer,
        remote_id: &str,
        status: EndPollStatus,
    ) -> Result<RemotePoll> {
        let remote = self
            .call(streamer, |auth| {
                let api = Arc::clone(&self.api);
                let remote_id = remote_id.to_string();
                async move { api.end_poll(&auth, &remote_id, status).await }
            })
            .await?;
        debug!(
            streamer_id = %streamer.id,
            remote_poll_id = %remote_id,
            status = status.as_str(),
            "native poll ended"
        );
        Ok(remote)
    }

    async fn call<T, F, Fut>(&self, streamer: &Streamer, op: F) -> Result<T>
    where
        F: Fn(ProviderAuth) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let credential = self.active_credential(streamer).await?;
        let auth = |access_token: Secret<String>| ProviderAuth {
            broadcaster_id: streamer.provider_user_id.clone(),
            access_token,
        };

        match op(auth(credential.access_token.clone())).await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Unauthorized) => {
                debug!(streamer_id = %streamer.id, "access token rejected, refreshing");
            },
            Err(e) => return Err(e.into()),
        }

        let access_token = self.refresh(streamer, &credential).await?;
        match op(auth(access_token)).await {
            Ok(value) => Ok(value),
            Err(ProviderError::Unauthorized) => {
                warn!(streamer_id = %streamer.id, "access token rejected after refresh");
                Err(unauthorized(streamer))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn active_credential(&self, streamer: &Streamer) -> Result<StreamerCredential> {
        self.store
            .get_credential(&streamer.id)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| unauthorized(streamer))
    }

    /// Refresh the token pair of `streamer` unless a concurrent caller already
    /// replaced `stale`. Returns the access token to retry with.
    async fn refresh(
        &self,
        streamer: &Streamer,
        stale: &StreamerCredential,
    ) -> Result<Secret<String>> {
        let lock = self.refresh_lock(&streamer.id);
        let _guard = lock.lock().await;

        let mut current = self.active_credential(streamer).await?;
        if current.access_token.expose_secret() != stale.access_token.expose_secret() {
            debug!(streamer_id = %streamer.id, "token already refreshed by a concurrent call");
            return Ok(current.access_token);
        }

        let pair = self
            .refresher
            .refresh(&current.refresh_token)
            .await
            .map_err(|e| match e {
                ProviderError::Unauthorized => unauthorized(streamer),
                other => Error::Provider(other),
            })?;

        current.access_token = pair.access_token.clone();
        current.refresh_token = pair.refresh_token;
        if !pair.scopes.is_empty() {
            current.scopes = pair.scopes;
        }
        current.updated_at = chrono::Utc::now();
        self.store.save_credential(&current).await?;
        info!(streamer_id = %streamer.id, "provider token refreshed");
        Ok(pair.access_token)
    }

    fn refresh_lock(&self, streamer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(streamer_id.to_string()).or_default())
    }
}

fn unauthorized(streamer: &Streamer) -> Error {
    Error::Unauthorized {
        streamer_id: streamer.id.clone(),
    }
}

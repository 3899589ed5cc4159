//! Scripted provider, chat and publisher doubles for unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tokio::sync::mpsc,
};

use crate::{
    broadcast::EventPublisher,
    provider::{
        ChatConnector, ChatIdentity, ChatSender, ChatSession, CreatePollRequest, EndPollStatus,
        InboundChatMessage, NativePollApi, ProviderAuth, ProviderError, ProviderResult,
        RemotePoll, RemotePollStatus, TokenPair, TokenRefresher,
    },
};

#[derive(Default)]
pub struct RecordingSender {
    pub lines: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub fail_sends: AtomicBool,
}

#[async_trait]
impl ChatSender for RecordingSender {
    async fn say(&self, text: &str) -> ProviderResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("socket closed".into()));
        }
        self.lines.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> ProviderResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeSession {
    pub channel: String,
    pub login: String,
    pub sender: Arc<RecordingSender>,
    pub inject: mpsc::Sender<InboundChatMessage>,
}

/// Chat connector whose sessions are kept for inspection.
#[derive(Default)]
pub struct FakeChat {
    pub sessions: Mutex<Vec<FakeSession>>,
    pub refuse: Mutex<HashSet<String>>,
}

impl FakeChat {
    pub fn lines(&self, channel: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.channel == channel)
            .flat_map(|s| s.sender.lines.lock().unwrap().clone())
            .collect()
    }

    pub fn session_count(&self, channel: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.channel == channel)
            .count()
    }

    pub fn sender(&self, channel: &str) -> Arc<RecordingSender> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.iter().rev().find(|s| s.channel == channel).unwrap();
        Arc::clone(&session.sender)
    }

    /// Deliver a chat line typed by `from` on the latest session of `channel`.
    pub async fn say_in(&self, channel: &str, from: &str, text: &str) {
        self.deliver(channel, from, text, false).await;
    }

    /// Deliver the local echo of a line the session itself said.
    pub async fn echo_in(&self, channel: &str, text: &str) {
        self.deliver(channel, "", text, true).await;
    }

    async fn deliver(&self, channel: &str, from: &str, text: &str, is_self: bool) {
        let (inject, login) = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.iter().rev().find(|s| s.channel == channel).unwrap();
            (session.inject.clone(), session.login.clone())
        };
        inject
            .send(InboundChatMessage {
                sender_login: if is_self { login } else { from.into() },
                text: text.into(),
                is_self,
            })
            .await
            .unwrap();
    }
}

#[async_trait]
impl ChatConnector for FakeChat {
    async fn connect(&self, identity: ChatIdentity) -> ProviderResult<ChatSession> {
        if self.refuse.lock().unwrap().contains(&identity.channel) {
            return Err(ProviderError::Transport("login failed".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let sender = Arc::new(RecordingSender::default());
        self.sessions.lock().unwrap().push(FakeSession {
            channel: identity.channel.clone(),
            login: identity.login.clone(),
            sender: Arc::clone(&sender),
            inject: tx,
        });
        Ok(ChatSession {
            sender,
            inbound: rx,
        })
    }
}

/// Native poll API keyed by broadcaster id.
#[derive(Default)]
pub struct FakeNative {
    pub votes: Mutex<HashMap<String, Vec<u64>>>,
    pub status: Mutex<HashMap<String, RemotePollStatus>>,
    pub created: Mutex<Vec<(String, CreatePollRequest)>>,
    pub ended: Mutex<Vec<(String, EndPollStatus)>>,
    /// Broadcasters whose every call is rejected as unauthorized.
    pub reject: Mutex<HashSet<String>>,
    /// Broadcasters whose poll reads fail with a server error.
    pub broken_reads: Mutex<HashSet<String>>,
}

impl FakeNative {
    pub fn set_votes(&self, broadcaster_id: &str, votes: Vec<u64>) {
        self.votes
            .lock()
            .unwrap()
            .insert(broadcaster_id.into(), votes);
    }

    fn remote(&self, broadcaster_id: &str) -> RemotePoll {
        RemotePoll {
            id: format!("remote-{broadcaster_id}"),
            status: self
                .status
                .lock()
                .unwrap()
                .get(broadcaster_id)
                .cloned()
                .unwrap_or(RemotePollStatus::Active),
            votes: self
                .votes
                .lock()
                .unwrap()
                .get(broadcaster_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn check(&self, auth: &ProviderAuth) -> ProviderResult<()> {
        if self.reject.lock().unwrap().contains(&auth.broadcaster_id) {
            Err(ProviderError::Unauthorized)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NativePollApi for FakeNative {
    async fn create_poll(
        &self,
        auth: &ProviderAuth,
        request: &CreatePollRequest,
    ) -> ProviderResult<RemotePoll> {
        self.check(auth)?;
        self.created
            .lock()
            .unwrap()
            .push((auth.broadcaster_id.clone(), request.clone()));
        Ok(self.remote(&auth.broadcaster_id))
    }

    async fn get_poll(&self, auth: &ProviderAuth, _remote_id: &str) -> ProviderResult<RemotePoll> {
        self.check(auth)?;
        if self.broken_reads.lock().unwrap().contains(&auth.broadcaster_id) {
            return Err(ProviderError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self.remote(&auth.broadcaster_id))
    }

    async fn end_poll(
        &self,
        auth: &ProviderAuth,
        remote_id: &str,
        status: EndPollStatus,
    ) -> ProviderResult<RemotePoll> {
        self.check(auth)?;
        self.ended
            .lock()
            .unwrap()
            .push((remote_id.to_string(), status));
        Ok(self.remote(&auth.broadcaster_id))
    }
}

/// Refresher that always hands out the same new pair.
pub struct FixedRefresher;

#[async_trait]
impl TokenRefresher for FixedRefresher {
    async fn refresh(&self, refresh_token: &Secret<String>) -> ProviderResult<TokenPair> {
        Ok(TokenPair {
            access_token: Secret::new(format!("fresh-{}", refresh_token.expose_secret())),
            refresh_token: Secret::new(refresh_token.expose_secret().clone()),
            scopes: Vec::new(),
            expires_in: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingPublisher {
    pub fn on(&self, channel: &str, event: &str) -> Vec<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, e, _)| c == channel && e == event)
            .map(|(_, _, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, channel: &str, event: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((channel.into(), event.into(), payload));
    }
}

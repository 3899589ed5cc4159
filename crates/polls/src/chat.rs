//! Chat vote channels: one live chat connection per (streamer, poll).

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    pollcast_config::MessagesConfig,
    pollcast_counters::{CounterKey, VoteCounterStore},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    provider::{ChatConnector, ChatIdentity, ChatSender, InboundChatMessage},
    types::Poll,
};

const KEYCAPS: [&str; 10] = [
    "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟",
];

/// Parse a chat message as a vote.
///
/// The trimmed text must be ASCII digits only, naming an option in
/// `1..=options_count`. Returns the 0-based option index.
#[must_use]
pub fn parse_vote(text: &str, options_count: usize) -> Option<usize> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let choice: usize = text.parse().ok()?;
    (1..=options_count).contains(&choice).then(|| choice - 1)
}

/// Multi-line announcement posted when a chat poll opens.
#[must_use]
pub fn format_intro(messages: &MessagesConfig, poll: &Poll) -> String {
    let mut lines = vec![
        messages
            .poll_header
            .replace("{duration}", &poll.duration_secs.to_string()),
        poll.question.clone(),
    ];
    for (i, option) in poll.options.iter().enumerate() {
        let badge = KEYCAPS
            .get(i)
            .map_or_else(|| format!("{}.", i + 1), |k| (*k).to_string());
        lines.push(format!("{badge} {option}"));
    }
    let choices = (1..=poll.options.len())
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(messages.vote_hint.replace("{choices}", &choices));
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatKey {
    pub streamer_id: String,
    pub poll_id: String,
}

impl ChatKey {
    pub fn new(streamer_id: impl Into<String>, poll_id: impl Into<String>) -> Self {
        Self {
            streamer_id: streamer_id.into(),
            poll_id: poll_id.into(),
        }
    }
}

struct ChatClient {
    sender: Arc<dyn ChatSender>,
    active: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Registry of open chat vote channels.
pub struct ChatVoteChannels {
    connector: Arc<dyn ChatConnector>,
    counters: Arc<dyn VoteCounterStore>,
    clients: Mutex<HashMap<ChatKey, ChatClient>>,
    line_delay: Duration,
}

impl ChatVoteChannels {
    pub fn new(
        connector: Arc<dyn ChatConnector>,
        counters: Arc<dyn VoteCounterStore>,
        line_delay: Duration,
    ) -> Self {
        Self {
            connector,
            counters,
            clients: Mutex::new(HashMap::new()),
            line_delay,
        }
    }

    /// Connect under `identity` and start counting votes for `key`.
    ///
    /// Opening a key that is already open does nothing and returns `false`.
    pub async fn open(
        &self,
        key: ChatKey,
        identity: ChatIdentity,
        options_count: usize,
    ) -> Result<bool> {
        if self.is_open(&key) {
            warn!(
                streamer_id = %key.streamer_id,
                poll_id = %key.poll_id,
                "chat channel already open"
            );
            return Ok(false);
        }

        let channel = identity.channel.clone();
        let session = self
            .connector
            .connect(identity)
            .await
            .map_err(|e| Error::provisioning(&key.streamer_id, format!("chat connect: {e}")))?;

        let active = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_votes(
            CounterKey::new(&key.poll_id, &key.streamer_id),
            session.inbound,
            Arc::clone(&active),
            Arc::clone(&self.counters),
            options_count,
        ));
        let client = ChatClient {
            sender: session.sender,
            active,
            reader,
        };

        let raced = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            if clients.contains_key(&key) {
                Some(client)
            } else {
                clients.insert(key.clone(), client);
                None
            }
        };
        if let Some(extra) = raced {
            warn!(
                streamer_id = %key.streamer_id,
                poll_id = %key.poll_id,
                "chat channel opened concurrently, dropping duplicate"
            );
            release(extra).await;
            return Ok(false);
        }

        info!(
            streamer_id = %key.streamer_id,
            poll_id = %key.poll_id,
            channel = %channel,
            "chat channel opened"
        );
        Ok(true)
    }

    #[must_use]
    pub fn is_open(&self, key: &ChatKey) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Post `text` on the channel of `key`, one line per message.
    ///
    /// Returns whether every line went out. Failures are logged only.
    pub async fn send(&self, key: &ChatKey, text: &str) -> bool {
        let sender = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|c| Arc::clone(&c.sender));
        match sender {
            Some(sender) => self.send_lines(sender.as_ref(), key, text).await,
            None => {
                debug!(
                    streamer_id = %key.streamer_id,
                    poll_id = %key.poll_id,
                    "no open chat channel, message dropped"
                );
                false
            },
        }
    }

    /// Send `text` to every listed streamer's channel for `poll_id`
    /// concurrently. Returns `(delivered, failed)`.
    pub async fn broadcast(
        &self,
        poll_id: &str,
        streamer_ids: &[String],
        text: &str,
    ) -> (usize, usize) {
        let keys: Vec<ChatKey> = streamer_ids
            .iter()
            .map(|id| ChatKey::new(id, poll_id))
            .collect();
        let outcomes = futures::future::join_all(keys.iter().map(|k| self.send(k, text))).await;
        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let failed = outcomes.len() - delivered;
        debug!(poll_id, delivered, failed, "chat broadcast");
        (delivered, failed)
    }

    /// Stop counting, optionally post `closing`, then release the connection.
    ///
    /// Returns `false` when `key` was not open.
    pub async fn disconnect(&self, key: &ChatKey, closing: Option<&str>) -> bool {
        let client = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        let Some(client) = client else {
            debug!(
                streamer_id = %key.streamer_id,
                poll_id = %key.poll_id,
                "chat channel already closed"
            );
            return false;
        };

        client.active.store(false, Ordering::Release);
        if let Some(text) = closing {
            self.send_lines(client.sender.as_ref(), key, text).await;
        }
        release(client).await;
        info!(
            streamer_id = %key.streamer_id,
            poll_id = %key.poll_id,
            "chat channel closed"
        );
        true
    }

    /// Close every open channel without a closing message.
    pub async fn close_all(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in clients {
            client.active.store(false, Ordering::Release);
            release(client).await;
        }
    }

    async fn send_lines(&self, sender: &dyn ChatSender, key: &ChatKey, text: &str) -> bool {
        let mut all_sent = true;
        let lines = text.split('\n').map(str::trim).filter(|l| !l.is_empty());
        for (i, line) in lines.enumerate() {
            if i > 0 && !self.line_delay.is_zero() {
                tokio::time::sleep(self.line_delay).await;
            }
            if let Err(e) = sender.say(line).await {
                all_sent = false;
                warn!(
                    streamer_id = %key.streamer_id,
                    poll_id = %key.poll_id,
                    error = %e,
                    "chat send failed"
                );
            }
        }
        all_sent
    }
}

async fn release(client: ChatClient) {
    client.active.store(false, Ordering::Release);
    if let Err(e) = client.sender.close().await {
        debug!(error = %e, "chat connection close failed");
    }
    client.reader.abort();
}

async fn read_votes(
    key: CounterKey,
    mut inbound: mpsc::Receiver<InboundChatMessage>,
    active: Arc<AtomicBool>,
    counters: Arc<dyn VoteCounterStore>,
    options_count: usize,
) {
    while let Some(message) = inbound.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }
        if message.is_self {
            continue;
        }
        let Some(option_index) = parse_vote(&message.text, options_count) else {
            continue;
        };
        match counters.increment(&key, option_index).await {
            Ok(count) => debug!(
                poll_id = %key.poll_id,
                streamer_id = %key.streamer_id,
                voter = %message.sender_login,
                option_index,
                count,
                "chat vote"
            ),
            Err(e) => warn!(
                poll_id = %key.poll_id,
                streamer_id = %key.streamer_id,
                error = %e,
                "chat vote not counted"
            ),
        }
    }
    debug!(poll_id = %key.poll_id, streamer_id = %key.streamer_id, "chat reader stopped");
}

//! Chat connections over Twitch IRC on WebSocket.
//!
//! Each [`ChatSession`] owns one socket, driven by a background task that
//! answers PINGs, forwards `PRIVMSG`s to the session's inbound channel and
//! writes queued outbound lines. A dropped socket is re-established with
//! exponential backoff until the session is closed.
//!
//! Twitch never echoes a client's own `PRIVMSG`, so every line read from the
//! socket counts as someone else's, including lines the broadcaster types from
//! another client. Lines said through the session come back on the inbound
//! channel as a local echo flagged `is_self`.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    pollcast_config::TwitchConfig,
    pollcast_polls::provider::{
        ChatConnector, ChatIdentity, ChatSender, ChatSession, InboundChatMessage, ProviderError,
        ProviderResult,
    },
    secrecy::ExposeSecret,
    tokio::{net::TcpStream, sync::mpsc},
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Context, Error, Result},
    irc::{self, IrcLine},
};

type IrcSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

enum Outbound {
    Say(String),
    Close,
}

pub struct IrcChatConnector {
    url: String,
}

impl IrcChatConnector {
    pub fn new(config: &TwitchConfig) -> Self {
        Self::with_url(config.chat_url.clone())
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChatConnector for IrcChatConnector {
    async fn connect(&self, identity: ChatIdentity) -> ProviderResult<ChatSession> {
        let socket = login(&self.url, &identity).await?;
        info!(channel = %identity.channel, login = %identity.login, "chat connected");

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        tokio::spawn(run_session(
            self.url.clone(),
            identity,
            socket,
            outbound_rx,
            inbound_tx,
        ));

        Ok(ChatSession {
            sender: Arc::new(IrcSender {
                outbound: outbound_tx,
            }),
            inbound: inbound_rx,
        })
    }
}

struct IrcSender {
    outbound: mpsc::Sender<Outbound>,
}

#[async_trait]
impl ChatSender for IrcSender {
    async fn say(&self, text: &str) -> ProviderResult<()> {
        self.outbound
            .send(Outbound::Say(text.to_string()))
            .await
            .map_err(|_| ProviderError::Transport("chat connection closed".into()))
    }

    async fn close(&self) -> ProviderResult<()> {
        // the session task may already be gone
        let _ = self.outbound.send(Outbound::Close).await;
        Ok(())
    }
}

/// Open the socket, authenticate and join the channel.
async fn login(url: &str, identity: &ChatIdentity) -> Result<IrcSocket> {
    let handshake = async {
        let (mut socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::external(format!("failed to reach chat server {url}"), e))?;
        socket
            .send(Message::Text(
                irc::pass(identity.access_token.expose_secret()).into(),
            ))
            .await?;
        socket
            .send(Message::Text(irc::nick(&identity.login).into()))
            .await?;
        wait_for_welcome(&mut socket).await?;
        socket
            .send(Message::Text(irc::join(&identity.channel).into()))
            .await?;
        Ok::<_, Error>(socket)
    };
    tokio::time::timeout(LOGIN_TIMEOUT, handshake)
        .await
        .context("chat login timed out")?
}

async fn wait_for_welcome(socket: &mut IrcSocket) -> Result<()> {
    while let Some(frame) = socket.next().await {
        match frame? {
            Message::Text(text) => {
                for raw in text.as_str().lines() {
                    let Some(line) = IrcLine::parse(raw) else {
                        continue;
                    };
                    if line.command == "001" {
                        return Ok(());
                    }
                    if irc::is_login_failure(&line) {
                        return Err(Error::LoginRejected {
                            notice: line.trailing.unwrap_or_default().to_string(),
                        });
                    }
                    if line.command == "PING" {
                        socket.send(Message::Text(irc::pong(&line).into())).await?;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {},
        }
    }
    Err(Error::message("connection closed during login"))
}

enum Pumped {
    /// The session was closed on purpose.
    Closed,
    /// The socket dropped or the server asked to reconnect.
    Lost(String),
}

async fn run_session(
    url: String,
    identity: ChatIdentity,
    mut socket: IrcSocket,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<InboundChatMessage>,
) {
    loop {
        match pump(&mut socket, &identity, &mut outbound, &inbound).await {
            Pumped::Closed => {
                let _ = socket
                    .send(Message::Text(irc::part(&identity.channel).into()))
                    .await;
                let _ = socket.close(None).await;
                debug!(channel = %identity.channel, "chat session closed");
                return;
            },
            Pumped::Lost(reason) => {
                warn!(channel = %identity.channel, reason = %reason, "chat connection lost");
            },
        }

        match reconnect(&url, &identity, &mut outbound).await {
            Some(fresh) => socket = fresh,
            None => return,
        }
    }
}

/// Log in again with backoff. Returns `None` when the session was closed
/// meanwhile or every attempt failed.
async fn reconnect(
    url: &str,
    identity: &ChatIdentity,
    outbound: &mut mpsc::Receiver<Outbound>,
) -> Option<IrcSocket> {
    let mut backoff = Duration::from_millis(500);
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        let wait = tokio::time::sleep(backoff);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                () = &mut wait => break,
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Say(_)) => {
                        debug!(channel = %identity.channel, "dropping chat line while reconnecting");
                    },
                    Some(Outbound::Close) | None => return None,
                },
            }
        }

        match login(url, identity).await {
            Ok(socket) => {
                info!(channel = %identity.channel, attempt, "chat reconnected");
                return Some(socket);
            },
            Err(Error::LoginRejected { notice }) => {
                warn!(channel = %identity.channel, notice = %notice, "chat login rejected, giving up");
                return None;
            },
            Err(e) => {
                warn!(channel = %identity.channel, attempt, error = %e, "chat reconnect failed");
            },
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    warn!(channel = %identity.channel, "chat reconnect attempts exhausted");
    None
}

async fn pump(
    socket: &mut IrcSocket,
    identity: &ChatIdentity,
    outbound: &mut mpsc::Receiver<Outbound>,
    inbound: &mpsc::Sender<InboundChatMessage>,
) -> Pumped {
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    for raw in text.as_str().lines() {
                        let Some(line) = IrcLine::parse(raw) else {
                            continue;
                        };
                        match line.command {
                            "PING" => {
                                if let Err(e) = socket.send(Message::Text(irc::pong(&line).into())).await {
                                    return Pumped::Lost(e.to_string());
                                }
                            },
                            "PRIVMSG" => {
                                let Some(message) = inbound_message(&line) else {
                                    continue;
                                };
                                if inbound.send(message).await.is_err() {
                                    // nobody reads votes any more
                                    return Pumped::Closed;
                                }
                            },
                            "RECONNECT" => return Pumped::Lost("server requested reconnect".into()),
                            _ => {},
                        }
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        return Pumped::Lost(e.to_string());
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Pumped::Lost("closed by server".into()),
                Some(Ok(_)) => {},
                Some(Err(e)) => return Pumped::Lost(e.to_string()),
            },
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Say(text)) => {
                    let line = irc::privmsg(&identity.channel, &text);
                    if let Err(e) = socket.send(Message::Text(line.into())).await {
                        return Pumped::Lost(e.to_string());
                    }
                    // a full or closed inbound only loses the echo
                    let _ = inbound.try_send(InboundChatMessage {
                        sender_login: identity.login.clone(),
                        text,
                        is_self: true,
                    });
                },
                Some(Outbound::Close) | None => return Pumped::Closed,
            },
        }
    }
}

fn inbound_message(line: &IrcLine<'_>) -> Option<InboundChatMessage> {
    Some(InboundChatMessage {
        sender_login: line.nick()?.to_string(),
        text: line.trailing.unwrap_or_default().to_string(),
        is_self: false,
    })
}

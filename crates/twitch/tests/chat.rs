#![allow(clippy::unwrap_used, clippy::expect_used)]
//! IRC chat sessions against a local WebSocket server.

use std::time::Duration;

use {
    futures::{SinkExt, StreamExt},
    pollcast_polls::provider::{ChatConnector, ChatIdentity, InboundChatMessage, ProviderError},
    pollcast_twitch::IrcChatConnector,
    secrecy::Secret,
    tokio::{net::TcpListener, sync::mpsc},
    tokio_tungstenite::tungstenite::Message,
};

fn identity(token: &str) -> ChatIdentity {
    ChatIdentity {
        login: "alice".into(),
        access_token: Secret::new(token.into()),
        channel: "alice".into(),
    }
}

/// Accepts one connection, answers the login and reports every line the
/// client sends. Lines pushed into the returned sender go to the client.
async fn irc_server(accept_token: &'static str) -> (String, mpsc::Receiver<String>, mpsc::Sender<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::channel(32);
    let (push_tx, mut push_rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut accepted = false;
        loop {
            tokio::select! {
                frame = ws.next() => {
                    let Some(Ok(Message::Text(text))) = frame else { return };
                    let line = text.as_str().to_string();
                    if let Some(token) = line.strip_prefix("PASS oauth:") {
                        accepted = token == accept_token;
                    } else if line.starts_with("NICK") {
                        let reply = if accepted {
                            ":tmi.twitch.tv 001 alice :Welcome, GLHF!"
                        } else {
                            ":tmi.twitch.tv NOTICE * :Login authentication failed"
                        };
                        ws.send(Message::Text(reply.into())).await.unwrap();
                    }
                    let _ = seen_tx.send(line).await;
                },
                Some(line) = push_rx.recv() => {
                    ws.send(Message::Text(line.into())).await.unwrap();
                },
            }
        }
    });
    (url, seen_rx, push_tx)
}

async fn next_line(seen: &mut mpsc::Receiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn next_message(inbound: &mut mpsc::Receiver<InboundChatMessage>) -> InboundChatMessage {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn session_joins_relays_votes_and_speaks() {
    let (url, mut seen, push) = irc_server("secret").await;
    let connector = IrcChatConnector::with_url(url);
    let mut session = connector.connect(identity("secret")).await.unwrap();

    assert_eq!(next_line(&mut seen).await, "PASS oauth:secret");
    assert_eq!(next_line(&mut seen).await, "NICK alice");
    assert_eq!(next_line(&mut seen).await, "JOIN #alice");

    push.send("PING :tmi.twitch.tv".into()).await.unwrap();
    assert_eq!(next_line(&mut seen).await, "PONG :tmi.twitch.tv");

    push.send(":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #alice :2".into())
        .await
        .unwrap();
    // the broadcaster voting from their own chat client
    push.send(":alice!alice@alice.tmi.twitch.tv PRIVMSG #alice :1".into())
        .await
        .unwrap();
    let vote = next_message(&mut session.inbound).await;
    assert_eq!(vote.sender_login, "viewer");
    assert_eq!(vote.text, "2");
    assert!(!vote.is_self);
    let streamer_vote = next_message(&mut session.inbound).await;
    assert_eq!(streamer_vote.sender_login, "alice");
    assert_eq!(streamer_vote.text, "1");
    assert!(!streamer_vote.is_self);

    session.sender.say("hello").await.unwrap();
    assert_eq!(next_line(&mut seen).await, "PRIVMSG #alice :hello");
    let echo = next_message(&mut session.inbound).await;
    assert_eq!(echo.text, "hello");
    assert!(echo.is_self);

    session.sender.close().await.unwrap();
    assert_eq!(next_line(&mut seen).await, "PART #alice");
}

#[tokio::test]
async fn rejected_login_is_unauthorized() {
    let (url, _seen, _push) = irc_server("secret").await;
    let connector = IrcChatConnector::with_url(url);
    let err = connector.connect(identity("stale")).await.err().unwrap();
    assert!(matches!(err, ProviderError::Unauthorized));
}

use std::sync::Arc;

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    serde_json::json,
    tokio::sync::{broadcast::error::RecvError, mpsc},
    tracing::{debug, info, warn},
};

use crate::broadcast::Broadcaster;

/// Channel names requested in a raw query string (`channel` may repeat).
/// Blank and duplicate names are dropped.
pub fn requested_channels(query: Option<&str>) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        let value = value.trim();
        if key == "channel" && !value.is_empty() && !channels.iter().any(|c| c == value) {
            channels.push(value.to_string());
        }
    }
    channels
}

/// Serve one subscriber: forward every frame of `channels` until either side
/// closes. Client messages other than Close are ignored.
pub async fn handle_connection(socket: WebSocket, broadcaster: Arc<Broadcaster>, channels: Vec<String>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, channels = ?channels, "ws: new subscriber");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<Arc<str>>(64);

    // Subscribe before acknowledging so nothing published after the ack is missed.
    let mut forwarders = Vec::with_capacity(channels.len());
    for channel in &channels {
        let mut rx = broadcaster.subscribe(channel);
        let tx = client_tx.clone();
        let channel = channel.clone();
        let conn_id = conn_id.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conn_id = %conn_id, channel = %channel, skipped, "ws: subscriber lagging, frames skipped");
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    let ack = json!({ "type": "subscribed", "channels": channels }).to_string();
    if client_tx.send(Arc::from(ack)).await.is_err() {
        return;
    }
    drop(client_tx);

    let write_conn_id = conn_id.clone();
    let mut write_handle = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            if ws_tx.send(Message::Text(frame.as_ref().into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut write_handle => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, error = %e, "ws: read error");
                    break;
                },
            },
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    write_handle.abort();
    info!(conn_id = %conn_id, "ws: subscriber disconnected");
}

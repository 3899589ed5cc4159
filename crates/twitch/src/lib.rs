//! Twitch bindings for the poll engine.
//!
//! - [`helix::HelixClient`]: native polls over the Helix REST API
//! - [`oauth::TwitchTokenRefresher`]: refresh-token grant
//! - [`chat::IrcChatConnector`]: chat over IRC on WebSocket

pub mod chat;
pub mod error;
pub mod helix;
pub mod irc;
pub mod oauth;

pub use {
    chat::IrcChatConnector,
    error::{Error, Result},
    helix::HelixClient,
    oauth::TwitchTokenRefresher,
};

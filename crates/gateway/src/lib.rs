//! Gateway: event fan-out hub, WebSocket subscriptions and the HTTP control
//! API in front of the poll controller.
//!
//! Lifecycle:
//! 1. Open the poll store and run migrations
//! 2. Connect the vote counter store (Redis, or process memory)
//! 3. Build the Twitch clients and the poll controller
//! 4. Serve HTTP + WebSocket until shutdown, then stop every running poll

pub mod api;
pub mod broadcast;
pub mod server;
pub mod services;
pub mod state;
pub mod ws;

pub use {
    broadcast::{Broadcaster, EventFrame},
    server::{build_gateway_app, start_gateway},
    state::AppState,
};

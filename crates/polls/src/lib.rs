//! Multi-channel poll engine.
//!
//! A poll runs on every authorized streamer's channel at once, either through
//! the provider's native poll feature or through numeric chat votes. The
//! [`controller::PollController`] owns the lifecycle: it provisions one
//! channel per streamer, drives a fixed-cadence aggregation loop that merges
//! all channels into one tally, and tears everything down at the deadline or
//! on cancel.

pub mod aggregate;
pub mod aggregation;
pub mod broadcast;
pub mod chat;
pub mod controller;
pub mod countdown;
pub mod crypto;
pub mod error;
pub mod native;
pub mod provider;
pub mod provisioning;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use {
    aggregate::Aggregate,
    controller::{LaunchReport, PollController, PollView},
    error::{Error, Result},
    store::PollStore,
    types::{
        AuthorizationWindow, ChannelLink, ChannelMode, LinkStatus, ModeKind, Poll, PollResult,
        PollStatus, Streamer, StreamerCredential,
    },
};

/// Run database migrations for the poll store.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

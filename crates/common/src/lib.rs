//! Shared error plumbing, identifiers and time helpers used across pollcast crates.

pub mod error;
pub mod time;

pub use error::FromMessage;

/// Generate a fresh random identifier for polls, links and results.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

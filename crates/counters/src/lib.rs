//! Vote counters for chat-mode channels.
//!
//! Counters are namespaced per (poll, streamer) and hold one integer per
//! 0-indexed option. Redis is the shared primary; when it cannot be reached
//! the [`FallbackCounterStore`] keeps accepting votes in process memory.

pub mod error;
pub mod fallback;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use {
    error::{Error, Result},
    fallback::FallbackCounterStore,
    memory::InMemoryCounterStore,
    redis_store::RedisCounterStore,
    store::{CounterKey, VoteCounterStore, VoteCounts},
};

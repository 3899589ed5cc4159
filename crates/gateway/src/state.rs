use std::sync::Arc;

use pollcast_polls::PollController;

use crate::broadcast::Broadcaster;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PollController>,
    pub broadcaster: Arc<Broadcaster>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(controller: Arc<PollController>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            controller,
            broadcaster,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

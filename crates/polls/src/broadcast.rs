//! Lifecycle and tally events sent to overlays, dashboards and streamers.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tracing::warn,
};

use crate::{
    aggregate::Aggregate,
    store::PollStore,
    types::{MembershipStatus, Poll},
};

pub const POLL_START: &str = "poll:start";
pub const POLL_UPDATE: &str = "poll:update";
pub const POLL_END: &str = "poll:end";
pub const STREAMER_LEFT_CAMPAIGN: &str = "streamer:left-campaign";

/// Fan-out sink. Delivery is best effort: no persistence, no replay.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, payload: Value);
}

#[must_use]
pub fn poll_channel(poll_id: &str) -> String {
    format!("poll:{poll_id}")
}

#[must_use]
pub fn streamer_channel(streamer_id: &str) -> String {
    format!("streamer:{streamer_id}:polls")
}

#[must_use]
pub fn start_payload(poll: &Poll) -> Value {
    json!({
        "poll_id": poll.id,
        "campaign_id": poll.campaign_id,
        "question": poll.question,
        "options": poll.options,
        "duration_seconds": poll.duration_secs,
        "started_at": poll.started_at,
        "ends_at": poll.ends_at(),
    })
}

#[must_use]
pub fn update_payload(aggregate: &Aggregate) -> Value {
    json!({
        "poll_id": aggregate.poll_id,
        "votes_by_option": aggregate.votes_by_option(),
        "total_votes": aggregate.total_votes,
        "percentages": aggregate.percentages_by_option(),
    })
}

#[must_use]
pub fn end_payload(aggregate: &Aggregate, cancelled: bool) -> Value {
    json!({
        "poll_id": aggregate.poll_id,
        "final_votes": aggregate.votes_by_option(),
        "total_votes": aggregate.total_votes,
        "percentages": aggregate.percentages_by_option(),
        "winner_index": aggregate.winner_index(),
        "cancelled": cancelled,
    })
}

/// Publishes poll events on the poll channel and mirrors lifecycle events to
/// the personal channel of every active campaign member.
pub struct PollBroadcaster {
    publisher: Arc<dyn EventPublisher>,
    store: Arc<dyn PollStore>,
}

impl PollBroadcaster {
    pub fn new(publisher: Arc<dyn EventPublisher>, store: Arc<dyn PollStore>) -> Self {
        Self { publisher, store }
    }

    pub async fn start(&self, poll: &Poll) {
        let payload = start_payload(poll);
        self.publisher
            .publish(&poll_channel(&poll.id), POLL_START, payload.clone())
            .await;
        self.mirror(poll, POLL_START, payload).await;
    }

    pub async fn update(&self, aggregate: &Aggregate) {
        self.publisher
            .publish(
                &poll_channel(&aggregate.poll_id),
                POLL_UPDATE,
                update_payload(aggregate),
            )
            .await;
    }

    pub async fn end(&self, poll: &Poll, aggregate: &Aggregate, cancelled: bool) {
        let payload = end_payload(aggregate, cancelled);
        self.publisher
            .publish(&poll_channel(&poll.id), POLL_END, payload.clone())
            .await;
        self.mirror(poll, POLL_END, payload).await;
    }

    pub async fn streamer_left(&self, campaign_id: &str, streamer_id: &str, poll_ids: &[String]) {
        self.publisher
            .publish(
                &streamer_channel(streamer_id),
                STREAMER_LEFT_CAMPAIGN,
                json!({
                    "campaign_id": campaign_id,
                    "streamer_id": streamer_id,
                    "poll_ids": poll_ids,
                }),
            )
            .await;
    }

    async fn mirror(&self, poll: &Poll, event: &str, mut payload: Value) {
        let Some(campaign_id) = poll.campaign_id.as_deref() else {
            return;
        };
        let members = match self.store.campaign_members(campaign_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(poll_id = %poll.id, campaign_id, error = %e, "cannot mirror poll event");
                return;
            },
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("campaign_id".into(), json!(campaign_id));
        }
        let sends = members
            .iter()
            .filter(|m| m.status == MembershipStatus::Active)
            .map(|m| {
                let channel = streamer_channel(&m.streamer_id);
                let payload = payload.clone();
                async move { self.publisher.publish(&channel, event, payload).await }
            });
        futures::future::join_all(sends).await;
    }
}

//! Timed chat announcements for the chat-mode channels of a poll.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    pollcast_config::MessagesConfig,
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::chat::ChatVoteChannels;

/// How late a warning may still go out when the countdown is armed late.
const MISSED_TOLERANCE: Duration = Duration::from_secs(1);

/// One announcement, `at` after the poll started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownStep {
    pub at: Duration,
    pub text: String,
}

/// Announcements for a poll lasting `duration_secs`, in firing order.
///
/// "10 seconds left" when the poll lasts at least 10s, then each of the last
/// five seconds that fits in the duration, then the closing line at the end.
#[must_use]
pub fn plan(duration_secs: u32, messages: &MessagesConfig) -> Vec<CountdownStep> {
    let at = |offset: u32| Duration::from_secs(u64::from(duration_secs - offset));
    let mut steps = Vec::with_capacity(7);
    if duration_secs >= 10 {
        steps.push(CountdownStep {
            at: at(10),
            text: messages.countdown_ten.clone(),
        });
    }
    for remaining in (1..=5).rev() {
        if duration_secs >= remaining {
            steps.push(CountdownStep {
                at: at(remaining),
                text: remaining.to_string(),
            });
        }
    }
    steps.push(CountdownStep {
        at: at(0),
        text: messages.countdown_closed.clone(),
    });
    steps
}

struct Schedule {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-poll countdown timers.
pub struct CountdownAnnouncer {
    chat: Arc<ChatVoteChannels>,
    messages: MessagesConfig,
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl CountdownAnnouncer {
    pub fn new(chat: Arc<ChatVoteChannels>, messages: MessagesConfig) -> Self {
        Self {
            chat,
            messages,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the countdown of `poll_id` on the chat channels of `streamer_ids`.
    ///
    /// Offsets count from `started`, the launch instant, however late the
    /// countdown is armed. Re-arming a poll replaces its previous schedule.
    pub fn schedule(
        &self,
        poll_id: &str,
        duration_secs: u32,
        streamer_ids: Vec<String>,
        started: Instant,
    ) {
        let steps = plan(duration_secs, &self.messages);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_countdown(
            Arc::clone(&self.chat),
            poll_id.to_string(),
            streamer_ids,
            steps,
            started,
            cancel.clone(),
        ));

        let previous = self
            .schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(poll_id.to_string(), Schedule { cancel, task });
        if let Some(previous) = previous {
            warn!(poll_id, "countdown re-armed, previous schedule dropped");
            previous.cancel.cancel();
            previous.task.abort();
        }
        debug!(poll_id, duration_secs, "countdown scheduled");
    }

    /// Clear every announcement of `poll_id` that has not fired yet.
    ///
    /// Returns `false`, with a warning, when nothing was scheduled.
    pub fn cancel_countdown(&self, poll_id: &str) -> bool {
        let schedule = self
            .schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(poll_id);
        match schedule {
            Some(schedule) => {
                schedule.cancel.cancel();
                schedule.task.abort();
                info!(poll_id, "countdown cancelled");
                true
            },
            None => {
                warn!(poll_id, "no countdown scheduled");
                false
            },
        }
    }

    /// Let the remaining announcements of `poll_id` fire, waiting at most
    /// `grace`, then drop the schedule. Returns whether one existed.
    pub async fn finish(&self, poll_id: &str, grace: Duration) -> bool {
        let schedule = self
            .schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(poll_id);
        let Some(mut schedule) = schedule else {
            return false;
        };
        if tokio::time::timeout(grace, &mut schedule.task).await.is_err() {
            warn!(poll_id, "countdown still pending at poll end, dropping it");
            schedule.cancel.cancel();
            schedule.task.abort();
        }
        true
    }

    #[must_use]
    pub fn is_scheduled(&self, poll_id: &str) -> bool {
        self.schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(poll_id)
    }

    /// Cancel every schedule, e.g. on shutdown.
    pub fn cancel_all(&self) {
        let mut schedules = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        for (_, schedule) in schedules.drain() {
            schedule.cancel.cancel();
            schedule.task.abort();
        }
    }
}

async fn run_countdown(
    chat: Arc<ChatVoteChannels>,
    poll_id: String,
    streamer_ids: Vec<String>,
    steps: Vec<CountdownStep>,
    started: Instant,
    cancel: CancellationToken,
) {
    let last = steps.len().saturating_sub(1);
    for (index, step) in steps.into_iter().enumerate() {
        let due = started + step.at;
        // stale warnings are skipped, the closing line always goes out
        if index < last && Instant::now() > due + MISSED_TOLERANCE {
            debug!(poll_id = %poll_id, text = %step.text, "countdown announcement missed, skipping");
            continue;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(due) => {},
        }
        if cancel.is_cancelled() {
            return;
        }
        let (delivered, failed) = chat.broadcast(&poll_id, &streamer_ids, &step.text).await;
        debug!(poll_id = %poll_id, text = %step.text, delivered, failed, "countdown announcement");
    }
}

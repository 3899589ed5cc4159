//! Merged tally across every channel link of a poll.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ChannelLink, Poll};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub poll_id: String,
    pub options: Vec<String>,
    /// Summed votes per option, in option order.
    pub votes: Vec<u64>,
    pub total_votes: u64,
    /// Share of `total_votes` per option, two decimals, all zero without votes.
    pub percentages: Vec<f64>,
}

impl Aggregate {
    /// Sum the current counts of `links` for `poll`.
    pub fn from_links(poll: &Poll, links: &[ChannelLink]) -> Self {
        let mut votes = vec![0_u64; poll.options.len()];
        for link in links {
            for (slot, n) in votes.iter_mut().zip(&link.votes) {
                *slot += n;
            }
        }
        let total_votes = votes.iter().sum();
        Self {
            poll_id: poll.id.clone(),
            options: poll.options.clone(),
            percentages: percentages(&votes),
            votes,
            total_votes,
        }
    }

    #[must_use]
    pub fn winner_index(&self) -> Option<usize> {
        winner_index(&self.votes)
    }

    /// Counts keyed by option index, as sent to overlays.
    #[must_use]
    pub fn votes_by_option(&self) -> BTreeMap<String, u64> {
        self.votes
            .iter()
            .enumerate()
            .map(|(i, n)| (i.to_string(), *n))
            .collect()
    }

    #[must_use]
    pub fn percentages_by_option(&self) -> BTreeMap<String, f64> {
        self.percentages
            .iter()
            .enumerate()
            .map(|(i, p)| (i.to_string(), *p))
            .collect()
    }

    /// Counts keyed by option label.
    #[must_use]
    pub fn votes_by_label(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for (label, n) in self.options.iter().zip(&self.votes) {
            *out.entry(label.clone()).or_insert(0) += n;
        }
        out
    }
}

/// Per-option share rounded to two decimals.
#[must_use]
pub fn percentages(votes: &[u64]) -> Vec<f64> {
    let total: u64 = votes.iter().sum();
    if total == 0 {
        return vec![0.0; votes.len()];
    }
    votes
        .iter()
        .map(|&n| (n as f64 * 10_000.0 / total as f64).round() / 100.0)
        .collect()
}

/// Index of the strictly highest count. The first maximum wins a tie and an
/// empty tally has no winner.
#[must_use]
pub fn winner_index(votes: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, &n) in votes.iter().enumerate() {
        if n > best.map_or(0, |(_, b)| b) {
            best = Some((i, n));
        }
    }
    best.map(|(i, _)| i)
}

//! Per-conversation start accounting over a trailing window.

use crate::types::ConversationId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct ConversationRate {
    last_run_at: Option<DateTime<Utc>>,
    /// Start timestamps, oldest first.
    starts: VecDeque<DateTime<Utc>>,
}

/// Job starts per conversation, across all job types.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: chrono::Duration,
    conversations: HashMap<ConversationId, ConversationRate>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1)),
            conversations: HashMap::new(),
        }
    }

    pub fn record_start(&mut self, conversation_id: &ConversationId, now: DateTime<Utc>) {
        let entry = self
            .conversations
            .entry(conversation_id.clone())
            .or_default();
        entry.last_run_at = Some(now);
        entry.starts.push_back(now);
    }

    /// Give back the most recent attempt, e.g. after a failed run.
    pub fn release_attempt(&mut self, conversation_id: &ConversationId) {
        if let Some(entry) = self.conversations.get_mut(conversation_id) {
            entry.starts.pop_back();
        }
    }

    pub fn attempts(&self, conversation_id: &ConversationId, now: DateTime<Utc>) -> u32 {
        let cutoff = now - self.window;
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.starts.iter().filter(|at| **at > cutoff).count() as u32)
            .unwrap_or(0)
    }

    pub fn last_run_at(&self, conversation_id: &ConversationId) -> Option<DateTime<Utc>> {
        self.conversations
            .get(conversation_id)
            .and_then(|entry| entry.last_run_at)
    }

    /// Time until the oldest in-window start ages out.
    pub fn window_reset_in(&self, conversation_id: &ConversationId, now: DateTime<Utc>) -> Duration {
        let cutoff = now - self.window;
        self.conversations
            .get(conversation_id)
            .and_then(|entry| entry.starts.iter().find(|at| **at > cutoff))
            .map(|oldest| (*oldest + self.window - now).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Drop starts older than the window and forget idle conversations.
    /// Returns how many conversations were forgotten.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.conversations.len();
        self.conversations.retain(|_, entry| {
            while entry.starts.front().is_some_and(|at| *at <= cutoff) {
                entry.starts.pop_front();
            }
            let recently_ran = entry.last_run_at.is_some_and(|at| at > cutoff);
            !entry.starts.is_empty() || recently_ran
        });
        before - self.conversations.len()
    }

    pub fn tracked_conversations(&self) -> usize {
        self.conversations.len()
    }
}

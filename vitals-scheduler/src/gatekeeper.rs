//! Admission decisions. Pure: reads a state snapshot, never mutates it.

use crate::config::ThrottleLimits;
use crate::state::ThrottleState;
use crate::types::{ConversationId, JobType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    HourlyLimit,
    TooFrequent,
    DuplicateRunning,
    Saturated,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HourlyLimit => "hourly limit reached",
            Self::TooFrequent => "too frequent",
            Self::DuplicateRunning => "duplicate running",
            Self::Saturated => "saturated",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: DenyReason,
    pub wait_hint: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    fn deny(reason: DenyReason, wait_hint: Duration) -> Self {
        Self::Deny(Denial { reason, wait_hint })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Self::Allow => None,
            Self::Deny(denial) => Some(denial.reason),
        }
    }

    pub fn wait_hint(&self) -> Duration {
        match self {
            Self::Allow => Duration::ZERO,
            Self::Deny(denial) => denial.wait_hint,
        }
    }
}

/// Whether a job for `conversation_id` may start now.
///
/// Checks run in order and stop at the first failure. Manual requests skip
/// the hourly and interval checks; duplicate and saturation checks always apply.
pub fn can_run(
    state: &ThrottleState,
    limits: &ThrottleLimits,
    conversation_id: &ConversationId,
    job_type: JobType,
    manual: bool,
    now: DateTime<Utc>,
) -> Decision {
    if !manual {
        if state.rate.attempts(conversation_id, now) >= limits.max_attempts_per_hour {
            return Decision::deny(
                DenyReason::HourlyLimit,
                state.rate.window_reset_in(conversation_id, now),
            );
        }

        if let Some(last_run_at) = state.rate.last_run_at(conversation_id) {
            let elapsed = (now - last_run_at).to_std().unwrap_or_default();
            let min_interval = limits.min_interval();
            if elapsed < min_interval {
                return Decision::deny(DenyReason::TooFrequent, min_interval - elapsed);
            }
        }
    }

    if state
        .active
        .values()
        .any(|job| job.same_target(conversation_id, job_type))
    {
        return Decision::deny(DenyReason::DuplicateRunning, Duration::ZERO);
    }

    if state.active.len() >= limits.max_concurrent {
        return Decision::deny(DenyReason::Saturated, limits.retry_backoff());
    }

    Decision::Allow
}

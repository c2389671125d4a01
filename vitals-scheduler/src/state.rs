//! The owned scheduler state and its transitions.
//!
//! Each `&mut self` method is one atomic transition; callers hold the state
//! lock for exactly one call.

use crate::config::ThrottleLimits;
use crate::gatekeeper::{Decision, Denial, can_run};
use crate::rate_window::RateWindow;
use crate::types::{AnalysisJob, ConversationId, JobId, JobType, MANUAL_PRIORITY, queue_order};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ThrottleState {
    pub(crate) active: HashMap<JobId, AnalysisJob>,
    /// Sorted by `queue_order`.
    pub(crate) queued: Vec<AnalysisJob>,
    pub(crate) rate: RateWindow,
    next_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    /// The new job's id, or the id of the job that absorbed this request.
    pub job_id: JobId,
    pub deduplicated: bool,
    /// The absorbing job is already running, so nothing was queued.
    pub running: bool,
    pub priority: u8,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone)]
pub enum DrainStep {
    /// Nothing queued.
    Idle,
    /// Every slot is taken.
    Saturated,
    /// Queued work exists but none of it is admissible yet.
    Blocked { retry_in: Duration },
    Promoted { job: AnalysisJob, remaining: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub queued: Vec<JobId>,
    pub active: Vec<JobId>,
}

impl CancelReport {
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.active.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversationLoad {
    pub queued: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub active: Vec<AnalysisJob>,
    pub queued: Vec<AnalysisJob>,
    pub tracked_conversations: usize,
}

impl ThrottleState {
    pub fn new(limits: &ThrottleLimits) -> Self {
        Self {
            active: HashMap::new(),
            queued: Vec::new(),
            rate: RateWindow::new(limits.window()),
            next_sequence: 0,
        }
    }

    fn build_job(
        &mut self,
        conversation_id: &ConversationId,
        job_type: JobType,
        manual: bool,
        now: DateTime<Utc>,
    ) -> AnalysisJob {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        AnalysisJob {
            id: JobId::generate(conversation_id, job_type),
            conversation_id: conversation_id.clone(),
            job_type,
            priority: job_type.priority(manual),
            manual,
            created_at: now,
            sequence,
        }
    }

    fn find_target(&self, conversation_id: &ConversationId, job_type: JobType) -> Option<&AnalysisJob> {
        self.queued
            .iter()
            .chain(self.active.values())
            .find(|job| job.same_target(conversation_id, job_type))
    }

    /// Queue a job unless the same (conversation, type) is already queued or running.
    ///
    /// A manual request that collides with a queued automatic job raises that
    /// job to manual priority instead of adding a second one.
    pub fn enqueue(
        &mut self,
        conversation_id: &ConversationId,
        job_type: JobType,
        manual: bool,
        now: DateTime<Utc>,
    ) -> EnqueueReceipt {
        if manual {
            if let Some(receipt) = self.raise_to_manual(conversation_id, job_type) {
                return receipt;
            }
        }
        if let Some(existing) = self.find_target(conversation_id, job_type) {
            tracing::debug!(
                conversation_id = %conversation_id,
                job_type = %job_type,
                existing_job_id = %existing.id,
                "dropping duplicate enqueue"
            );
            return EnqueueReceipt {
                job_id: existing.id.clone(),
                deduplicated: true,
                running: self.active.contains_key(&existing.id),
                priority: existing.priority,
            };
        }

        let job = self.build_job(conversation_id, job_type, manual, now);
        let receipt = EnqueueReceipt {
            job_id: job.id.clone(),
            deduplicated: false,
            running: false,
            priority: job.priority,
        };
        self.insert_queued(job);
        receipt
    }

    fn raise_to_manual(
        &mut self,
        conversation_id: &ConversationId,
        job_type: JobType,
    ) -> Option<EnqueueReceipt> {
        let index = self
            .queued
            .iter()
            .position(|job| !job.manual && job.same_target(conversation_id, job_type))?;
        let mut job = self.queued.remove(index);
        job.manual = true;
        job.priority = MANUAL_PRIORITY;
        tracing::debug!(job_id = %job.id, "queued job raised to manual priority");
        let receipt = EnqueueReceipt {
            job_id: job.id.clone(),
            deduplicated: true,
            running: false,
            priority: job.priority,
        };
        self.insert_queued(job);
        Some(receipt)
    }

    fn insert_queued(&mut self, job: AnalysisJob) {
        let position = self
            .queued
            .partition_point(|existing| queue_order(existing, &job).is_le());
        self.queued.insert(position, job);
    }

    /// Move `job` into a slot and charge its conversation one attempt.
    fn start(&mut self, job: AnalysisJob, now: DateTime<Utc>) -> bool {
        if self
            .active
            .values()
            .any(|running| running.same_target(&job.conversation_id, job.job_type))
        {
            tracing::warn!(
                job_id = %job.id,
                conversation_id = %job.conversation_id,
                job_type = %job.job_type,
                "duplicate active job; dropping"
            );
            return false;
        }
        self.rate.record_start(&job.conversation_id, now);
        self.active.insert(job.id.clone(), job);
        true
    }

    /// Promote the first admissible queued job, in queue order.
    pub fn promote_next(&mut self, limits: &ThrottleLimits, now: DateTime<Utc>) -> DrainStep {
        loop {
            if self.queued.is_empty() {
                return DrainStep::Idle;
            }
            if self.active.len() >= limits.max_concurrent {
                return DrainStep::Saturated;
            }
            let admissible = {
                let state: &ThrottleState = self;
                state.queued.iter().position(|job| {
                    can_run(
                        state,
                        limits,
                        &job.conversation_id,
                        job.job_type,
                        job.manual,
                        now,
                    )
                    .is_allowed()
                })
            };
            let Some(index) = admissible else {
                return DrainStep::Blocked {
                    retry_in: limits.retry_backoff(),
                };
            };

            let job = self.queued.remove(index);
            if self.start(job.clone(), now) {
                return DrainStep::Promoted {
                    job,
                    remaining: self.queued.len(),
                };
            }
        }
    }

    /// Admit a manual job straight into a slot, skipping the queue wait.
    ///
    /// A queued job for the same target is taken over, keeping its id.
    pub fn try_admit(
        &mut self,
        limits: &ThrottleLimits,
        conversation_id: &ConversationId,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<AnalysisJob, Denial> {
        if let Decision::Deny(denial) = can_run(self, limits, conversation_id, job_type, true, now) {
            return Err(denial);
        }

        let job = match self
            .queued
            .iter()
            .position(|job| job.same_target(conversation_id, job_type))
        {
            Some(index) => {
                let mut job = self.queued.remove(index);
                job.priority = MANUAL_PRIORITY;
                job.manual = true;
                job
            }
            None => self.build_job(conversation_id, job_type, true, now),
        };
        self.start(job.clone(), now);
        Ok(job)
    }

    /// Free a slot. A failed job gives its attempt back to the window.
    pub fn complete(&mut self, job_id: &JobId, success: bool) -> Option<AnalysisJob> {
        let job = self.active.remove(job_id)?;
        if !success {
            self.rate.release_attempt(&job.conversation_id);
        }
        Some(job)
    }

    /// Remove every queued and active job belonging to `conversation_id`.
    pub fn cancel_conversation(&mut self, conversation_id: &ConversationId) -> CancelReport {
        let mut report = CancelReport::default();
        self.queued.retain(|job| {
            if &job.conversation_id == conversation_id {
                report.queued.push(job.id.clone());
                false
            } else {
                true
            }
        });
        self.active.retain(|id, job| {
            if &job.conversation_id == conversation_id {
                report.active.push(id.clone());
                false
            } else {
                true
            }
        });
        report
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        self.rate.sweep(now)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active.contains_key(job_id)
    }

    /// Zero-based position in the queue.
    pub fn queue_position(&self, job_id: &JobId) -> Option<usize> {
        self.queued.iter().position(|job| &job.id == job_id)
    }

    pub fn conversation_load(&self, conversation_id: &ConversationId) -> ConversationLoad {
        ConversationLoad {
            queued: self
                .queued
                .iter()
                .filter(|job| &job.conversation_id == conversation_id)
                .count(),
            active: self
                .active
                .values()
                .filter(|job| &job.conversation_id == conversation_id)
                .count(),
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut active = self.active.values().cloned().collect::<Vec<_>>();
        active.sort_by(queue_order);
        SchedulerSnapshot {
            active,
            queued: self.queued.clone(),
            tracked_conversations: self.rate.tracked_conversations(),
        }
    }
}

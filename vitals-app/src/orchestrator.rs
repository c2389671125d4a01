//! Per-conversation analysis orchestration.
//!
//! The orchestrator turns message counts into scheduler requests, runs the
//! jobs the scheduler promotes, and keeps each conversation's
//! [`ConversationAnalysisState`] current. Every conversation carries a
//! generation counter; cancelling bumps it, and a run whose captured
//! generation no longer matches drops its results.

use crate::config::OrchestratorConfig;
use crate::report::{AnalysisRunReport, SubJobOutcome, SubJobStatus};
use crate::source::{ConversationSnapshot, ConversationSource};
use crate::stages::StageAnimator;
use crate::status::{ActiveAnalysis, ConversationAnalysisState, due_analysis};
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vitals_analysis::{
    AnalysisPayload, AnalysisRequest, Analyzer, Capability, ConversationMessage, DeepContext,
    recent_window,
};
use vitals_scheduler::{
    AnalysisJob, CancelReport, ConversationId, DenyReason, EnqueueReceipt, JobId, JobType,
    PatientId, PromotionReceiver, Scheduler,
};

/// Receives every run report that was still current when it finished.
pub type CompletionCallback = Arc<dyn Fn(&AnalysisRunReport) + Send + Sync>;

/// Job type used for manual requests.
const MANUAL_JOB_TYPE: JobType = JobType::Deep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ManualTrigger {
    /// Admitted into a slot and running now.
    Started { job_id: JobId },
    /// Could not start now; queued at manual priority.
    Queued {
        receipt: EnqueueReceipt,
        reason: DenyReason,
    },
    /// Could not start because the same analysis is already running for this
    /// conversation; nothing was queued and the caller's messages were dropped.
    Absorbed { job_id: JobId, reason: DenyReason },
}

struct ConversationSlot {
    generation: u64,
    status: watch::Sender<ConversationAnalysisState>,
    /// Generation captured when each pending job was requested. Kept across
    /// invalidation so a job promoted before a cancel is recognised as stale.
    job_generations: HashMap<JobId, u64>,
    /// Caller-supplied context for queued manual jobs.
    manual_snapshots: HashMap<JobId, ConversationSnapshot>,
    /// The regular/deep job reflected in `status`.
    running_job: Option<JobId>,
    stage_animator: Option<StageAnimator>,
}

impl ConversationSlot {
    fn new(cfg: &OrchestratorConfig) -> Self {
        let (status, _) = watch::channel(ConversationAnalysisState::new(
            cfg.regular_interval,
            cfg.deep_interval,
        ));
        Self {
            generation: 0,
            status,
            job_generations: HashMap::new(),
            manual_snapshots: HashMap::new(),
            running_job: None,
            stage_animator: None,
        }
    }
}

struct Inner {
    cfg: OrchestratorConfig,
    scheduler: Scheduler,
    analyzer: Arc<dyn Analyzer>,
    source: Arc<dyn ConversationSource>,
    conversations: DashMap<ConversationId, ConversationSlot>,
    on_complete: Option<CompletionCallback>,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct AnalysisOrchestrator {
    inner: Arc<Inner>,
}

impl AnalysisOrchestrator {
    /// Start dispatching jobs promoted by `scheduler`.
    pub async fn start(
        cfg: OrchestratorConfig,
        scheduler: Scheduler,
        promotions: PromotionReceiver,
        analyzer: Arc<dyn Analyzer>,
        source: Arc<dyn ConversationSource>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Self> {
        cfg.validate()?;
        let orchestrator = Self {
            inner: Arc::new(Inner {
                cfg,
                scheduler,
                analyzer,
                source,
                conversations: DashMap::new(),
                on_complete,
                shutdown: CancellationToken::new(),
                background_tasks: Mutex::new(Vec::new()),
            }),
        };
        orchestrator.spawn_dispatch_loop(promotions).await;
        Ok(orchestrator)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Stop dispatching, stop stage timers, and shut the scheduler down.
    /// Runs already in flight finish on their own.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = {
            let mut guard = self.inner.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "orchestrator background task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for orchestrator dispatch loop shutdown");
                }
            }
        }
        for mut slot in self.inner.conversations.iter_mut() {
            slot.stage_animator = None;
        }
        self.inner.scheduler.shutdown().await;
    }

    /// Record the new message count and request whatever analysis is due.
    ///
    /// A due analysis first cancels every pending and running job for the
    /// conversation; the new message makes their input stale.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id, message_count = message_count))]
    pub async fn on_message_appended(
        &self,
        conversation_id: &ConversationId,
        message_count: u32,
    ) -> Result<Option<EnqueueReceipt>> {
        let cfg = &self.inner.cfg;
        {
            let slot = self.slot(conversation_id);
            slot.status.send_modify(|state| {
                state.set_message_count(message_count, cfg.regular_interval, cfg.deep_interval)
            });
        }

        let Some(job_type) = due_analysis(message_count, cfg.regular_interval, cfg.deep_interval)
        else {
            self.refresh_load(conversation_id).await;
            return Ok(None);
        };

        let generation = self.invalidate(conversation_id);
        self.cancel_scheduled(conversation_id).await;
        let receipt = self
            .inner
            .scheduler
            .enqueue(conversation_id, job_type, false)
            .await?;
        self.slot(conversation_id)
            .job_generations
            .insert(receipt.job_id.clone(), generation);
        self.refresh_load(conversation_id).await;

        tracing::info!(job_type = %job_type, job_id = %receipt.job_id, "analysis requested");
        Ok(Some(receipt))
    }

    /// Queue a single job for this conversation without cancelling anything.
    pub async fn enqueue(
        &self,
        conversation_id: &ConversationId,
        job_type: JobType,
    ) -> Result<EnqueueReceipt> {
        let receipt = self
            .inner
            .scheduler
            .enqueue(conversation_id, job_type, false)
            .await?;
        if !receipt.deduplicated {
            let mut slot = self.slot(conversation_id);
            let generation = slot.generation;
            slot.job_generations
                .insert(receipt.job_id.clone(), generation);
        }
        self.refresh_load(conversation_id).await;
        Ok(receipt)
    }

    /// Run an analysis now if a slot can be had, otherwise queue it ahead of
    /// all automatic work.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id, patient_id = %patient_id))]
    pub async fn trigger_manual(
        &self,
        conversation_id: &ConversationId,
        patient_id: &PatientId,
        messages: Vec<ConversationMessage>,
    ) -> Result<ManualTrigger> {
        let snapshot = ConversationSnapshot {
            patient_id: patient_id.clone(),
            messages,
        };

        match self
            .inner
            .scheduler
            .try_start_now(conversation_id, MANUAL_JOB_TYPE)
            .await
        {
            Ok(job) => {
                let generation = {
                    let mut slot = self.slot(conversation_id);
                    slot.job_generations.remove(&job.id);
                    slot.manual_snapshots.remove(&job.id);
                    slot.generation
                };
                let job_id = job.id.clone();
                let this = self.clone();
                tokio::spawn(async move {
                    this.run(job, generation, Some(snapshot)).await;
                });
                Ok(ManualTrigger::Started { job_id })
            }
            Err(denial) => {
                let receipt = self
                    .inner
                    .scheduler
                    .enqueue(conversation_id, MANUAL_JOB_TYPE, true)
                    .await?;
                if receipt.running {
                    tracing::info!(
                        reason = %denial.reason,
                        job_id = %receipt.job_id,
                        "manual analysis absorbed by running job"
                    );
                    return Ok(ManualTrigger::Absorbed {
                        job_id: receipt.job_id,
                        reason: denial.reason,
                    });
                }
                {
                    let mut slot = self.slot(conversation_id);
                    let generation = slot.generation;
                    slot.job_generations
                        .entry(receipt.job_id.clone())
                        .or_insert(generation);
                    slot.manual_snapshots
                        .insert(receipt.job_id.clone(), snapshot);
                }
                self.refresh_load(conversation_id).await;
                tracing::info!(
                    reason = %denial.reason,
                    job_id = %receipt.job_id,
                    deduplicated = receipt.deduplicated,
                    "manual analysis queued"
                );
                Ok(ManualTrigger::Queued {
                    receipt,
                    reason: denial.reason,
                })
            }
        }
    }

    /// Drop all work for a conversation, e.g. when it is deleted or the user
    /// switches away. Runs already in flight finish, but their results are
    /// discarded.
    pub async fn cancel_all(&self, conversation_id: &ConversationId) -> CancelReport {
        self.invalidate(conversation_id);
        let report = self.cancel_scheduled(conversation_id).await;
        self.refresh_load(conversation_id).await;
        report
    }

    /// Cancel everything for a deleted conversation and drop its state.
    /// Subscribers see their channel close.
    pub async fn forget(&self, conversation_id: &ConversationId) -> CancelReport {
        self.invalidate(conversation_id);
        let report = self.inner.scheduler.cancel_all(conversation_id).await;
        self.inner.conversations.remove(conversation_id);
        tracing::debug!(conversation_id = %conversation_id, "conversation forgotten");
        report
    }

    pub fn tracked_conversations(&self) -> usize {
        self.inner.conversations.len()
    }

    pub fn subscribe(&self, conversation_id: &ConversationId) -> watch::Receiver<ConversationAnalysisState> {
        self.slot(conversation_id).status.subscribe()
    }

    pub async fn status(&self, conversation_id: &ConversationId) -> ConversationAnalysisState {
        self.refresh_load(conversation_id).await;
        self.slot(conversation_id).status.borrow().clone()
    }

    fn slot(
        &self,
        conversation_id: &ConversationId,
    ) -> dashmap::mapref::one::RefMut<'_, ConversationId, ConversationSlot> {
        self.inner
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationSlot::new(&self.inner.cfg))
    }

    /// Bump the generation and clear in-progress status. Returns the new generation.
    fn invalidate(&self, conversation_id: &ConversationId) -> u64 {
        let mut slot = self.slot(conversation_id);
        slot.generation = slot.generation.wrapping_add(1);
        slot.manual_snapshots.clear();
        slot.running_job = None;
        if let Some(animator) = slot.stage_animator.take() {
            animator.stop();
        }
        slot.status.send_modify(ConversationAnalysisState::clear_activity);
        slot.generation
    }

    /// Cancel in the scheduler. Queued jobs will never be promoted, so their
    /// generation entries go too.
    async fn cancel_scheduled(&self, conversation_id: &ConversationId) -> CancelReport {
        let report = self.inner.scheduler.cancel_all(conversation_id).await;
        if let Some(mut slot) = self.inner.conversations.get_mut(conversation_id) {
            for job_id in &report.queued {
                slot.job_generations.remove(job_id);
            }
        }
        report
    }

    fn is_current(&self, conversation_id: &ConversationId, generation: u64) -> bool {
        self.inner
            .conversations
            .get(conversation_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    async fn refresh_load(&self, conversation_id: &ConversationId) {
        let load = self
            .inner
            .scheduler
            .conversation_load(conversation_id)
            .await;
        let Some(slot) = self.inner.conversations.get(conversation_id) else {
            return;
        };
        slot.status.send_if_modified(|state| {
            let changed = state.queued_jobs != load.queued || state.active_jobs != load.active;
            state.queued_jobs = load.queued;
            state.active_jobs = load.active;
            changed
        });
    }

    async fn spawn_dispatch_loop(&self, mut promotions: PromotionReceiver) {
        let this = self.clone();
        let shutdown = self.inner.shutdown.child_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("orchestrator dispatch loop received shutdown signal");
                        break;
                    }
                    promoted = promotions.recv() => {
                        let Some(job) = promoted else {
                            tracing::info!("promotion channel closed; dispatch loop exiting");
                            break;
                        };
                        let runner = this.clone();
                        tokio::spawn(async move {
                            runner.dispatch(job).await;
                        });
                    }
                }
            }
        });
        self.inner.background_tasks.lock().await.push(handle);
    }

    async fn dispatch(&self, job: AnalysisJob) {
        let claimed = self
            .inner
            .conversations
            .get_mut(&job.conversation_id)
            .map(|mut slot| {
                let current = slot.generation;
                // A job promoted between enqueue and recording its generation
                // has no entry yet; it belongs to the live generation.
                let requested = slot.job_generations.remove(&job.id).unwrap_or(current);
                let snapshot = slot.manual_snapshots.remove(&job.id);
                (requested == current).then_some((current, snapshot))
            })
            .flatten();

        let runnable = match claimed {
            Some(claim) => self.inner.scheduler.is_active(&job.id).await.then_some(claim),
            None => None,
        };
        let Some((generation, snapshot)) = runnable else {
            tracing::debug!(job_id = %job.id, "skipping promoted job that was cancelled");
            self.inner.scheduler.complete_job(&job.id, true).await;
            return;
        };
        self.run(job, generation, snapshot).await;
    }

    /// Execute one job end to end and report it. Returns `None` when the
    /// result was discarded as stale.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(job_id = %job.id, conversation_id = %job.conversation_id, job_type = %job.job_type, generation = generation)
    )]
    async fn run(
        &self,
        job: AnalysisJob,
        generation: u64,
        snapshot: Option<ConversationSnapshot>,
    ) -> Option<AnalysisRunReport> {
        let started_at = Utc::now();
        let tracked = ActiveAnalysis::for_job(job.job_type) != ActiveAnalysis::None;
        if tracked {
            self.begin_analysis(&job, generation);
        }
        self.refresh_load(&job.conversation_id).await;

        let snapshot = match snapshot {
            Some(snapshot) => Ok(snapshot),
            None => self.inner.source.snapshot(&job.conversation_id).await,
        };
        let (patient_id, outcomes) = match snapshot {
            Ok(snapshot) => {
                let outcomes = self.fan_out(&job, &snapshot).await;
                (Some(snapshot.patient_id), outcomes)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load conversation for analysis");
                let outcomes = run_plan(job.job_type)
                    .iter()
                    .map(|capability| {
                        SubJobOutcome::failed(*capability, format!("load conversation: {e:#}"))
                    })
                    .collect();
                (None, outcomes)
            }
        };

        let success = outcomes.iter().all(SubJobOutcome::is_success);
        let report = AnalysisRunReport {
            run_id: Uuid::new_v4(),
            job_id: job.id.clone(),
            conversation_id: job.conversation_id.clone(),
            patient_id,
            job_type: job.job_type,
            manual: job.manual,
            started_at,
            finished_at: Utc::now(),
            success,
            outcomes,
        };

        self.inner.scheduler.complete_job(&job.id, success).await;

        if !self.is_current(&job.conversation_id, generation) {
            tracing::info!("discarding stale analysis result");
            return None;
        }

        if tracked {
            self.finish_analysis(&job);
        }
        self.refresh_load(&job.conversation_id).await;

        if !success {
            tracing::warn!(
                failed = report.failures().count(),
                succeeded = report.succeeded(),
                "analysis finished with partial failure"
            );
        } else {
            tracing::info!(succeeded = report.succeeded(), "analysis finished");
        }
        if let Some(callback) = self.inner.on_complete.as_ref() {
            callback(&report);
        }
        Some(report)
    }

    fn begin_analysis(&self, job: &AnalysisJob, generation: u64) {
        let Some(mut slot) = self.inner.conversations.get_mut(&job.conversation_id) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        slot.running_job = Some(job.id.clone());
        slot.status.send_modify(|state| {
            state.is_analyzing = true;
            state.active_type = ActiveAnalysis::for_job(job.job_type);
            state.current_stage_label = None;
        });

        slot.stage_animator = if job.job_type == JobType::Deep {
            let weak = Arc::downgrade(&self.inner);
            let conversation_id = job.conversation_id.clone();
            let job_id = job.id.clone();
            Some(StageAnimator::start(
                self.inner.cfg.stage_labels.clone(),
                self.inner.cfg.deep_stage_duration(),
                move |_, label| apply_stage(&weak, &conversation_id, &job_id, generation, label),
            ))
        } else {
            None
        };
    }

    fn finish_analysis(&self, job: &AnalysisJob) {
        let Some(mut slot) = self.inner.conversations.get_mut(&job.conversation_id) else {
            return;
        };
        if slot.running_job.as_ref() != Some(&job.id) {
            return;
        }
        slot.running_job = None;
        if let Some(animator) = slot.stage_animator.take() {
            animator.stop();
        }
        slot.status.send_modify(ConversationAnalysisState::clear_activity);
    }

    async fn fan_out(&self, job: &AnalysisJob, snapshot: &ConversationSnapshot) -> Vec<SubJobOutcome> {
        let context = if job.job_type == JobType::Deep {
            Some(self.deep_context(&job.conversation_id, &snapshot.patient_id).await)
        } else {
            None
        };

        let calls = run_plan(job.job_type).iter().map(|capability| {
            let request = AnalysisRequest {
                capability: *capability,
                conversation_id: job.conversation_id.to_string(),
                patient_id: snapshot.patient_id.to_string(),
                payload: self.payload_for(*capability, &snapshot.messages, context.as_ref()),
            };
            let analyzer = self.inner.analyzer.clone();
            async move {
                let result = analyzer.analyze(&request).await;
                let outcome = SubJobOutcome::from_result(request.capability, result);
                if let SubJobStatus::Failed { error } = &outcome.status {
                    tracing::warn!(capability = %request.capability, error = %error, "analysis sub-job failed");
                }
                outcome
            }
        });
        join_all(calls).await
    }

    fn payload_for(
        &self,
        capability: Capability,
        messages: &[ConversationMessage],
        context: Option<&DeepContext>,
    ) -> AnalysisPayload {
        match capability {
            Capability::TopicSolution => AnalysisPayload::Conversation {
                messages: messages.to_vec(),
                context: context.cloned(),
            },
            Capability::Diagnosis | Capability::Solution => AnalysisPayload::RecentMessages {
                messages: recent_window(messages, self.inner.cfg.recent_message_window),
            },
            Capability::Memory => AnalysisPayload::Identifiers,
        }
    }

    /// Memory and strategic reference for a deep run. Either may fail
    /// independently; a failure leaves that part empty.
    async fn deep_context(&self, conversation_id: &ConversationId, patient_id: &PatientId) -> DeepContext {
        let source = &self.inner.source;
        let (memory, strategic_reference) = tokio::join!(
            source.memory(conversation_id, patient_id),
            source.strategic_reference(patient_id)
        );
        let memory = memory.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "conversation memory unavailable for deep analysis");
            None
        });
        let mut strategic_reference = strategic_reference.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "strategic reference unavailable for deep analysis");
            Vec::new()
        });
        strategic_reference.sort_by(|a, b| b.priority.cmp(&a.priority));
        DeepContext {
            memory,
            strategic_reference,
        }
    }
}

fn apply_stage(
    inner: &Weak<Inner>,
    conversation_id: &ConversationId,
    job_id: &JobId,
    generation: u64,
    label: &str,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(slot) = inner.conversations.get(conversation_id) else {
        return;
    };
    if slot.generation != generation || slot.running_job.as_ref() != Some(job_id) {
        return;
    }
    slot.status.send_modify(|state| {
        state.current_stage_label = Some(label.to_string());
    });
}

/// Capabilities called for each job type.
fn run_plan(job_type: JobType) -> &'static [Capability] {
    match job_type {
        JobType::Regular => &[
            Capability::TopicSolution,
            Capability::Diagnosis,
            Capability::Solution,
        ],
        JobType::Deep => &[
            Capability::TopicSolution,
            Capability::Diagnosis,
            Capability::Solution,
            Capability::Memory,
        ],
        JobType::Diagnosis => &[Capability::Diagnosis],
        JobType::Solution => &[Capability::Solution],
        JobType::Memory => &[Capability::Memory],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryConversations;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vitals_analysis::{AnalysisError, AnalysisResult, HealthDataSummary};
    use vitals_scheduler::ThrottleLimits;

    #[derive(Default)]
    struct ScriptedAnalyzer {
        failing: HashSet<Capability>,
        delay: Duration,
        calls: std::sync::Mutex<Vec<AnalysisRequest>>,
    }

    impl ScriptedAnalyzer {
        fn calls(&self) -> Vec<AnalysisRequest> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(
            &self,
            request: &AnalysisRequest,
        ) -> std::result::Result<AnalysisResult, AnalysisError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.contains(&request.capability) {
                return Err(AnalysisError::Http(format!(
                    "{} unavailable",
                    request.capability
                )));
            }
            Ok(AnalysisResult::ok(json!({ "capability": request.capability })))
        }
    }

    struct Harness {
        orchestrator: AnalysisOrchestrator,
        store: Arc<InMemoryConversations>,
        analyzer: Arc<ScriptedAnalyzer>,
        reports: mpsc::UnboundedReceiver<AnalysisRunReport>,
    }

    impl Harness {
        async fn new(limits: ThrottleLimits, cfg: OrchestratorConfig, analyzer: ScriptedAnalyzer) -> Self {
            let (scheduler, promotions) = Scheduler::start(limits).await.expect("start scheduler");
            Self::with_promotions(scheduler, promotions, cfg, analyzer).await
        }

        /// Orchestrator fed by a hand-driven promotion channel. Returns the
        /// scheduler's own receiver and the sender the orchestrator listens on.
        async fn relayed(
            limits: ThrottleLimits,
            cfg: OrchestratorConfig,
            analyzer: ScriptedAnalyzer,
        ) -> (Self, PromotionReceiver, mpsc::UnboundedSender<AnalysisJob>) {
            let (scheduler, promotions) = Scheduler::start(limits).await.expect("start scheduler");
            let (relay_tx, relay_rx) = mpsc::unbounded_channel();
            let harness = Self::with_promotions(scheduler, relay_rx, cfg, analyzer).await;
            (harness, promotions, relay_tx)
        }

        async fn with_promotions(
            scheduler: Scheduler,
            promotions: PromotionReceiver,
            cfg: OrchestratorConfig,
            analyzer: ScriptedAnalyzer,
        ) -> Self {
            let store = Arc::new(InMemoryConversations::new());
            let analyzer = Arc::new(analyzer);
            let (tx, reports) = mpsc::unbounded_channel();
            let callback: CompletionCallback = Arc::new(move |report: &AnalysisRunReport| {
                let _ = tx.send(report.clone());
            });
            let orchestrator = AnalysisOrchestrator::start(
                cfg,
                scheduler,
                promotions,
                analyzer.clone(),
                store.clone(),
                Some(callback),
            )
            .await
            .expect("start orchestrator");
            Self {
                orchestrator,
                store,
                analyzer,
                reports,
            }
        }

        /// Append `count` messages and notify the orchestrator after the last.
        async fn append(&self, conversation_id: &ConversationId, count: u32) -> Option<EnqueueReceipt> {
            let patient = PatientId::new("patient-1");
            let mut total = 0;
            for i in 0..count {
                total = self.store.append(
                    conversation_id,
                    &patient,
                    ConversationMessage::user(format!("symptom note {i}")),
                );
            }
            self.orchestrator
                .on_message_appended(conversation_id, total)
                .await
                .expect("message appended")
        }

        async fn next_report(&mut self, within: Duration) -> Option<AnalysisRunReport> {
            tokio::time::timeout(within, self.reports.recv())
                .await
                .ok()
                .flatten()
        }
    }

    fn fast_limits() -> ThrottleLimits {
        ThrottleLimits {
            drain_debounce_ms: 5,
            drain_stagger_ms: 5,
            retry_backoff_ms: 50,
            ..ThrottleLimits::default()
        }
    }

    fn fast_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            deep_stage_duration_ms: 10,
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn sixth_message_triggers_deep_with_four_sub_jobs() {
        let mut h = Harness::new(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-deep");
        let patient = PatientId::new("patient-1");
        h.store.set_memory(&conv, json!({ "allergies": ["penicillin"] }));
        h.store.set_strategic_reference(
            &patient,
            vec![
                HealthDataSummary {
                    category: "sleep".to_string(),
                    priority: 1,
                    summary: "irregular".to_string(),
                },
                HealthDataSummary {
                    category: "blood_pressure".to_string(),
                    priority: 3,
                    summary: "elevated".to_string(),
                },
            ],
        );

        let receipt = h.append(&conv, 6).await.expect("analysis due");
        assert!(receipt.job_id.contains(":deep:"));

        let report = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("deep report");
        assert_eq!(report.job_type, JobType::Deep);
        assert!(report.success);
        assert_eq!(report.outcomes.len(), 4);

        let calls = h.analyzer.calls();
        let topic = calls
            .iter()
            .find(|c| c.capability == Capability::TopicSolution)
            .expect("topic call");
        let AnalysisPayload::Conversation { messages, context } = &topic.payload else {
            panic!("topic call should carry the conversation");
        };
        assert_eq!(messages.len(), 6);
        let context = context.as_ref().expect("deep context supplied");
        assert_eq!(context.memory, Some(json!({ "allergies": ["penicillin"] })));
        assert_eq!(context.strategic_reference[0].category, "blood_pressure");

        let memory = calls
            .iter()
            .find(|c| c.capability == Capability::Memory)
            .expect("memory call");
        assert!(matches!(memory.payload, AnalysisPayload::Identifiers));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn regular_run_sends_recent_window_to_diagnosis() {
        let mut h = Harness::new(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-regular");
        let receipt = h.append(&conv, 9).await.expect("analysis due");
        assert!(receipt.job_id.contains(":regular:"));

        let report = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("regular report");
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.data(Capability::Memory).is_none());

        let calls = h.analyzer.calls();
        assert_eq!(calls.len(), 3);
        let diagnosis = calls
            .iter()
            .find(|c| c.capability == Capability::Diagnosis)
            .expect("diagnosis call");
        let AnalysisPayload::RecentMessages { messages } = &diagnosis.payload else {
            panic!("diagnosis should receive recent messages");
        };
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[5].content, "symptom note 8");

        let status = h.orchestrator.status(&conv).await;
        assert!(!status.is_analyzing);
        assert_eq!(status.message_count, 9);
        assert_eq!(status.messages_until_deep, 3);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_results() {
        let analyzer = ScriptedAnalyzer {
            failing: [Capability::Diagnosis, Capability::Memory].into_iter().collect(),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(fast_limits(), fast_cfg(), analyzer).await;
        let conv = ConversationId::new("conv-partial");
        h.append(&conv, 6).await.expect("analysis due");

        let report = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("deep report");
        assert!(!report.success);
        assert_eq!(report.failures().count(), 2);
        assert_eq!(report.succeeded(), 2);
        assert!(report.data(Capability::TopicSolution).is_some());
        assert!(report.data(Capability::Solution).is_some());
        assert!(report.data(Capability::Diagnosis).is_none());

        let snapshot = h.orchestrator.scheduler().snapshot().await;
        assert!(snapshot.active.is_empty());
        let status = h.orchestrator.status(&conv).await;
        assert!(!status.is_analyzing);
        assert_eq!(status.active_type, ActiveAnalysis::None);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_run_result_is_discarded() {
        let analyzer = ScriptedAnalyzer {
            delay: Duration::from_millis(200),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(fast_limits(), fast_cfg(), analyzer).await;
        let conv = ConversationId::new("conv-cancel");
        let mut status_rx = h.orchestrator.subscribe(&conv);
        h.append(&conv, 1).await.expect("analysis due");

        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|state| state.is_analyzing),
        )
        .await
        .expect("analysis started in time")
        .expect("status channel open");

        let report = h.orchestrator.cancel_all(&conv).await;
        assert_eq!(report.active.len(), 1);

        assert!(h.next_report(Duration::from_millis(500)).await.is_none());
        let status = h.orchestrator.status(&conv).await;
        assert!(!status.is_analyzing);
        assert_eq!(status.active_jobs, 0);
        assert_eq!(status.queued_jobs, 0);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn deep_run_advances_stage_labels_then_clears_them() {
        let analyzer = ScriptedAnalyzer {
            delay: Duration::from_millis(150),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(fast_limits(), fast_cfg(), analyzer).await;
        let conv = ConversationId::new("conv-stages");
        let mut status_rx = h.orchestrator.subscribe(&conv);
        h.append(&conv, 6).await.expect("analysis due");

        let labels = crate::stages::default_stage_labels();
        let reached_last = tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|state| {
                state.current_stage_label.as_deref() == labels.last().map(String::as_str)
            }),
        )
        .await
        .expect("last stage reached in time")
        .expect("status channel open")
        .clone();
        assert!(reached_last.is_analyzing);
        assert_eq!(reached_last.active_type, ActiveAnalysis::Deep);

        h.next_report(Duration::from_secs(2))
            .await
            .expect("deep report");
        let done = h.orchestrator.status(&conv).await;
        assert!(!done.is_analyzing);
        assert!(done.current_stage_label.is_none());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn manual_trigger_starts_inline_while_automatic_is_throttled() {
        let mut h = Harness::new(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-manual");
        let patient = PatientId::new("patient-1");
        h.append(&conv, 1).await.expect("analysis due");
        h.next_report(Duration::from_secs(2))
            .await
            .expect("regular report");

        let automatic = h
            .orchestrator
            .scheduler()
            .can_run(&conv, JobType::Deep, false)
            .await;
        assert_eq!(automatic.reason(), Some(DenyReason::TooFrequent));

        let trigger = h
            .orchestrator
            .trigger_manual(&conv, &patient, vec![ConversationMessage::user("check me now")])
            .await
            .expect("manual trigger");
        assert!(matches!(trigger, ManualTrigger::Started { .. }));

        let report = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("manual report");
        assert!(report.manual);
        assert_eq!(report.job_type, JobType::Deep);
        assert_eq!(report.patient_id, Some(patient));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn manual_trigger_queues_at_top_priority_when_saturated() {
        let limits = ThrottleLimits {
            max_concurrent: 1,
            ..fast_limits()
        };
        let analyzer = ScriptedAnalyzer {
            delay: Duration::from_millis(100),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(limits, fast_cfg(), analyzer).await;
        let busy = ConversationId::new("conv-busy");
        let mut busy_rx = h.orchestrator.subscribe(&busy);
        h.append(&busy, 1).await.expect("analysis due");
        tokio::time::timeout(
            Duration::from_secs(2),
            busy_rx.wait_for(|state| state.is_analyzing),
        )
        .await
        .expect("busy analysis started")
        .expect("status channel open");

        let waiting = ConversationId::new("conv-waiting");
        let trigger = h
            .orchestrator
            .trigger_manual(
                &waiting,
                &PatientId::new("patient-2"),
                vec![ConversationMessage::user("urgent")],
            )
            .await
            .expect("manual trigger");
        let ManualTrigger::Queued { receipt, reason } = trigger else {
            panic!("expected manual request to queue");
        };
        assert_eq!(reason, DenyReason::Saturated);
        assert_eq!(receipt.priority, vitals_scheduler::MANUAL_PRIORITY);

        let first = h.next_report(Duration::from_secs(2)).await.expect("busy report");
        assert_eq!(first.conversation_id, busy);
        let second = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("queued manual report");
        assert_eq!(second.conversation_id, waiting);
        assert!(second.manual);
        assert_eq!(second.patient_id, Some(PatientId::new("patient-2")));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_conversation_fails_every_sub_job() {
        let mut h = Harness::new(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-ghost");
        h.orchestrator
            .enqueue(&conv, JobType::Diagnosis)
            .await
            .expect("enqueue diagnosis");

        let report = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("diagnosis report");
        assert!(!report.success);
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.patient_id.is_none());
        assert!(h.analyzer.calls().is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn job_promoted_before_cancel_is_never_run() {
        let (mut h, mut promotions, relay) =
            Harness::relayed(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-race");
        h.append(&conv, 1).await.expect("analysis due");
        let promoted = tokio::time::timeout(Duration::from_secs(2), promotions.recv())
            .await
            .expect("promotion in time")
            .expect("promotion channel open");

        let report = h.orchestrator.cancel_all(&conv).await;
        assert_eq!(report.active, vec![promoted.id.clone()]);
        relay.send(promoted).expect("relay promotion");

        assert!(h.next_report(Duration::from_millis(300)).await.is_none());
        assert!(h.analyzer.calls().is_empty());
        let status = h.orchestrator.status(&conv).await;
        assert!(!status.is_analyzing);
        assert_eq!(status.active_jobs, 0);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn stale_job_superseded_by_new_message_is_released() {
        let (mut h, mut promotions, relay) =
            Harness::relayed(fast_limits(), fast_cfg(), ScriptedAnalyzer::default()).await;
        let conv = ConversationId::new("conv-superseded");
        h.append(&conv, 1).await.expect("analysis due");
        let old = tokio::time::timeout(Duration::from_secs(2), promotions.recv())
            .await
            .expect("promotion in time")
            .expect("promotion channel open");

        let fresh = h.append(&conv, 1).await.expect("second analysis due");
        assert_ne!(fresh.job_id, old.id);
        relay.send(old).expect("relay stale promotion");
        assert!(h.next_report(Duration::from_millis(300)).await.is_none());
        assert!(h.analyzer.calls().is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn manual_request_during_running_deep_does_not_leak_context() {
        let limits = ThrottleLimits {
            min_interval_ms: 0,
            ..fast_limits()
        };
        let analyzer = ScriptedAnalyzer {
            delay: Duration::from_millis(100),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(limits, fast_cfg(), analyzer).await;
        let conv = ConversationId::new("conv-absorbed");
        let mut status_rx = h.orchestrator.subscribe(&conv);
        h.append(&conv, 6).await.expect("deep due");
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|state| state.is_analyzing),
        )
        .await
        .expect("deep started in time")
        .expect("status channel open");

        let trigger = h
            .orchestrator
            .trigger_manual(
                &conv,
                &PatientId::new("other-patient"),
                vec![ConversationMessage::user("stale manual text")],
            )
            .await
            .expect("manual trigger");
        let ManualTrigger::Absorbed { reason, .. } = trigger else {
            panic!("expected the running deep job to absorb the request");
        };
        assert_eq!(reason, DenyReason::DuplicateRunning);

        let first = h.next_report(Duration::from_secs(2)).await.expect("deep report");
        assert_eq!(first.patient_id, Some(PatientId::new("patient-1")));

        h.orchestrator
            .enqueue(&conv, JobType::Deep)
            .await
            .expect("enqueue deep");
        let second = h
            .next_report(Duration::from_secs(2))
            .await
            .expect("second deep report");
        assert!(!second.manual);
        assert_eq!(second.patient_id, Some(PatientId::new("patient-1")));
        let topic_calls = h
            .analyzer
            .calls()
            .into_iter()
            .filter(|c| c.capability == Capability::TopicSolution)
            .collect::<Vec<_>>();
        assert_eq!(topic_calls.len(), 2);
        assert!(topic_calls.iter().all(|c| c.patient_id == "patient-1"));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn forgetting_a_conversation_drops_its_state() {
        let analyzer = ScriptedAnalyzer {
            delay: Duration::from_millis(100),
            ..ScriptedAnalyzer::default()
        };
        let mut h = Harness::new(fast_limits(), fast_cfg(), analyzer).await;
        let conv = ConversationId::new("conv-deleted");
        let mut status_rx = h.orchestrator.subscribe(&conv);
        h.append(&conv, 1).await.expect("analysis due");
        tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|state| state.is_analyzing),
        )
        .await
        .expect("analysis started in time")
        .expect("status channel open");
        assert_eq!(h.orchestrator.tracked_conversations(), 1);

        let report = h.orchestrator.forget(&conv).await;
        assert_eq!(report.active.len(), 1);
        assert_eq!(h.orchestrator.tracked_conversations(), 0);
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            while status_rx.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok(), "status channel should close");

        assert!(h.next_report(Duration::from_millis(300)).await.is_none());
        assert_eq!(h.orchestrator.tracked_conversations(), 0);
        h.orchestrator.shutdown().await;
    }
}

use crate::config::ThrottleLimits;
use crate::error::{Result, SchedulerError};
use crate::gatekeeper::{Decision, Denial, can_run};
use crate::state::{
    CancelReport, ConversationLoad, DrainStep, EnqueueReceipt, SchedulerSnapshot, ThrottleState,
};
use crate::types::{AnalysisJob, ConversationId, JobId, JobType};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Jobs promoted by the drain loop, in promotion order.
pub type PromotionReceiver = mpsc::UnboundedReceiver<AnalysisJob>;

/// Owns the [`ThrottleState`] and the timers that drain it.
#[derive(Clone)]
pub struct Scheduler {
    limits: ThrottleLimits,
    state: Arc<Mutex<ThrottleState>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Validate `limits`, then start the drain and sweep loops.
    pub async fn start(limits: ThrottleLimits) -> Result<(Self, PromotionReceiver)> {
        limits.validate()?;
        let (promotions_tx, promotions_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            state: Arc::new(Mutex::new(ThrottleState::new(&limits))),
            limits,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        };
        scheduler.spawn_drain_loop(promotions_tx).await;
        scheduler.spawn_sweep_loop().await;
        Ok((scheduler, promotions_rx))
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "scheduler background task join failed");
                }
                Err(_) => {
                    tracing::warn!("timed out waiting for scheduler background task shutdown");
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %conversation_id, job_type = %job_type, manual = manual))]
    pub async fn enqueue(
        &self,
        conversation_id: &ConversationId,
        job_type: JobType,
        manual: bool,
    ) -> Result<EnqueueReceipt> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let receipt = {
            let mut state = self.state.lock().await;
            state.enqueue(conversation_id, job_type, manual, Utc::now())
        };
        if !receipt.deduplicated {
            tracing::debug!(job_id = %receipt.job_id, priority = receipt.priority, "job queued");
        }
        self.wake.notify_one();
        Ok(receipt)
    }

    pub async fn can_run(
        &self,
        conversation_id: &ConversationId,
        job_type: JobType,
        manual: bool,
    ) -> Decision {
        let state = self.state.lock().await;
        can_run(
            &state,
            &self.limits,
            conversation_id,
            job_type,
            manual,
            Utc::now(),
        )
    }

    /// Admit a manual job into a slot immediately, bypassing the queue wait.
    ///
    /// The caller runs the returned job itself; it is not sent to the
    /// promotion channel.
    pub async fn try_start_now(
        &self,
        conversation_id: &ConversationId,
        job_type: JobType,
    ) -> std::result::Result<AnalysisJob, Denial> {
        let admitted = {
            let mut state = self.state.lock().await;
            state.try_admit(&self.limits, conversation_id, job_type, Utc::now())
        };
        match &admitted {
            Ok(job) => {
                tracing::info!(job_id = %job.id, conversation_id = %conversation_id, job_type = %job_type, "manual job started");
            }
            Err(denial) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    job_type = %job_type,
                    reason = %denial.reason,
                    "manual job not admitted"
                );
            }
        }
        admitted
    }

    /// Free the job's slot. Returns false if the job was no longer active
    /// (already completed or cancelled).
    pub async fn complete_job(&self, job_id: &JobId, success: bool) -> bool {
        let completed = {
            let mut state = self.state.lock().await;
            state.complete(job_id, success)
        };
        self.wake.notify_one();
        match completed {
            Some(job) => {
                tracing::info!(
                    job_id = %job_id,
                    conversation_id = %job.conversation_id,
                    job_type = %job.job_type,
                    success,
                    "job completed"
                );
                true
            }
            None => {
                tracing::debug!(job_id = %job_id, "completion for inactive job ignored");
                false
            }
        }
    }

    pub async fn cancel_all(&self, conversation_id: &ConversationId) -> CancelReport {
        let report = {
            let mut state = self.state.lock().await;
            state.cancel_conversation(conversation_id)
        };
        if !report.is_empty() {
            tracing::info!(
                conversation_id = %conversation_id,
                queued = report.queued.len(),
                active = report.active.len(),
                "cancelled conversation jobs"
            );
            self.wake.notify_one();
        }
        report
    }

    pub async fn is_active(&self, job_id: &JobId) -> bool {
        self.state.lock().await.is_active(job_id)
    }

    pub async fn queue_position(&self, job_id: &JobId) -> Option<usize> {
        self.state.lock().await.queue_position(job_id)
    }

    pub async fn conversation_load(&self, conversation_id: &ConversationId) -> ConversationLoad {
        self.state.lock().await.conversation_load(conversation_id)
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        self.state.lock().await.snapshot()
    }

    async fn spawn_drain_loop(&self, promotions: mpsc::UnboundedSender<AnalysisJob>) {
        let limits = self.limits.clone();
        let state = self.state.clone();
        let wake = self.wake.clone();
        let shutdown = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            let mut next_tick: Option<Instant> = None;
            loop {
                let retry = async move {
                    match next_tick {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                let woken = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("scheduler drain loop received shutdown signal");
                        break;
                    }
                    _ = wake.notified() => true,
                    _ = retry => false,
                };
                if woken && !limits.drain_debounce().is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!("scheduler drain loop received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(limits.drain_debounce()) => {}
                    }
                }

                let step = {
                    let mut guard = state.lock().await;
                    guard.promote_next(&limits, Utc::now())
                };
                next_tick = match step {
                    DrainStep::Idle => None,
                    DrainStep::Saturated => Some(Instant::now() + limits.retry_backoff()),
                    DrainStep::Blocked { retry_in } => {
                        tracing::debug!(retry_in_ms = retry_in.as_millis() as u64, "no admissible job queued");
                        Some(Instant::now() + retry_in)
                    }
                    DrainStep::Promoted { job, remaining } => {
                        tracing::info!(
                            job_id = %job.id,
                            conversation_id = %job.conversation_id,
                            job_type = %job.job_type,
                            priority = job.priority,
                            remaining,
                            "job promoted"
                        );
                        let job_id = job.id.clone();
                        if promotions.send(job).is_err() {
                            tracing::warn!(job_id = %job_id, "promotion receiver closed; releasing slot");
                            state.lock().await.complete(&job_id, true);
                        }
                        if remaining > 0 {
                            Some(Instant::now() + limits.drain_stagger())
                        } else {
                            None
                        }
                    }
                };
            }
        });
        self.background_tasks.lock().await.push(handle);
    }

    async fn spawn_sweep_loop(&self) {
        let state = self.state.clone();
        let sweep_interval = self.limits.sweep_interval();
        let shutdown = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("scheduler sweep loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let forgotten = state.lock().await.sweep(Utc::now());
                        if forgotten > 0 {
                            tracing::debug!(forgotten, "rate window sweep");
                        }
                    }
                }
            }
        });
        self.background_tasks.lock().await.push(handle);
    }
}

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vitals_analysis::{
    AnalysisPayload, AnalysisRequest, AnalysisResult, Analyzer, Capability, ConversationMessage,
    HttpAnalyzer,
};
use vitals_app::{
    AnalysisOrchestrator, AnalysisRunReport, CompletionCallback, EngineConfig,
    InMemoryConversations,
};
use vitals_scheduler::{ConversationId, PatientId, Scheduler};

pub struct SimulationPlan {
    pub conversation: ConversationId,
    pub patient: PatientId,
    pub messages: u32,
    pub interval: Duration,
    pub manual_at: Option<u32>,
}

/// Answers every capability locally after a short delay.
struct DryRunAnalyzer {
    latency: Duration,
}

#[async_trait]
impl Analyzer for DryRunAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> vitals_analysis::Result<AnalysisResult> {
        tokio::time::sleep(self.latency).await;
        let seen = match &request.payload {
            AnalysisPayload::Conversation { messages, .. }
            | AnalysisPayload::RecentMessages { messages } => messages.len(),
            AnalysisPayload::Identifiers => 0,
        };
        let data = match request.capability {
            Capability::TopicSolution => json!({ "topics": [], "messages_seen": seen }),
            Capability::Diagnosis => json!({ "possible_conditions": [], "messages_seen": seen }),
            Capability::Solution => json!({ "solutions": [], "messages_seen": seen }),
            Capability::Memory => json!({ "updated": false }),
        };
        Ok(AnalysisResult::ok(data))
    }
}

pub async fn run(cfg: EngineConfig, plan: SimulationPlan) -> anyhow::Result<()> {
    let analyzer: Arc<dyn Analyzer> = match cfg.http_analyzer_config() {
        Some(http) => {
            tracing::info!(base_url = %http.base_url, "using remote analysis service");
            Arc::new(HttpAnalyzer::new(http)?)
        }
        None => {
            tracing::info!("using dry-run analyzer");
            Arc::new(DryRunAnalyzer {
                latency: Duration::from_millis(400),
            })
        }
    };

    let store = Arc::new(InMemoryConversations::new());
    let (scheduler, promotions) = Scheduler::start(cfg.scheduler.clone()).await?;
    let on_complete: CompletionCallback = Arc::new(|report: &AnalysisRunReport| {
        let failed = report
            .failures()
            .map(|outcome| outcome.capability.as_str())
            .collect::<Vec<_>>();
        tracing::info!(
            run_id = %report.run_id,
            job_id = %report.job_id,
            job_type = %report.job_type,
            manual = report.manual,
            success = report.success,
            succeeded = report.succeeded(),
            failed = ?failed,
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "analysis report"
        );
    });
    let orchestrator = AnalysisOrchestrator::start(
        cfg.orchestrator.clone(),
        scheduler,
        promotions,
        analyzer,
        store.clone(),
        Some(on_complete),
    )
    .await?;

    let mut status_rx = orchestrator.subscribe(&plan.conversation);
    let status_log = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let state = status_rx.borrow_and_update().clone();
            tracing::info!(
                analyzing = state.is_analyzing,
                active_type = ?state.active_type,
                stage = state.current_stage_label.as_deref().unwrap_or("-"),
                message_count = state.message_count,
                until_regular = state.messages_until_regular,
                until_deep = state.messages_until_deep,
                queued = state.queued_jobs,
                active = state.active_jobs,
                "status"
            );
        }
    });

    for i in 1..=plan.messages {
        let message = if i % 2 == 1 {
            ConversationMessage::user(format!("simulated symptom report {i}"))
        } else {
            ConversationMessage::assistant(format!("simulated follow-up question {i}"))
        };
        let count = store.append(&plan.conversation, &plan.patient, message);
        match orchestrator
            .on_message_appended(&plan.conversation, count)
            .await?
        {
            Some(receipt) if receipt.deduplicated => {
                tracing::debug!(job_id = %receipt.job_id, "analysis already pending");
            }
            Some(receipt) => {
                let position = orchestrator.scheduler().queue_position(&receipt.job_id).await;
                tracing::debug!(job_id = %receipt.job_id, queue_position = ?position, "analysis queued");
            }
            None => {}
        }

        if plan.manual_at == Some(i) {
            let messages = store.messages(&plan.conversation);
            let trigger = orchestrator
                .trigger_manual(&plan.conversation, &plan.patient, messages)
                .await?;
            tracing::info!(trigger = ?trigger, "manual analysis requested");
        }
        tokio::time::sleep(plan.interval).await;
    }

    wait_for_idle(&orchestrator, Duration::from_secs(30)).await;
    orchestrator.shutdown().await;
    status_log.abort();
    Ok(())
}

async fn wait_for_idle(orchestrator: &AnalysisOrchestrator, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let snapshot = orchestrator.scheduler().snapshot().await;
        if snapshot.active.is_empty() && snapshot.queued.is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                active = snapshot.active.len(),
                queued = snapshot.queued.len(),
                "simulation ended with work outstanding"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

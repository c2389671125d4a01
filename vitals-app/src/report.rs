use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vitals_analysis::{AnalysisError, AnalysisResult, Capability};
use vitals_scheduler::{ConversationId, JobId, JobType, PatientId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubJobStatus {
    Succeeded { data: serde_json::Value },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubJobOutcome {
    pub capability: Capability,
    #[serde(flatten)]
    pub status: SubJobStatus,
}

impl SubJobOutcome {
    pub fn failed(capability: Capability, error: impl Into<String>) -> Self {
        Self {
            capability,
            status: SubJobStatus::Failed {
                error: error.into(),
            },
        }
    }

    pub fn from_result(
        capability: Capability,
        result: Result<AnalysisResult, AnalysisError>,
    ) -> Self {
        match result {
            Ok(result) if result.success => Self {
                capability,
                status: SubJobStatus::Succeeded { data: result.data },
            },
            Ok(result) => Self::failed(
                capability,
                result
                    .error
                    .unwrap_or_else(|| "analysis reported failure".to_string()),
            ),
            Err(e) => Self::failed(capability, e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, SubJobStatus::Succeeded { .. })
    }
}

/// Aggregated result of one analysis job and all of its sub-jobs.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRunReport {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub conversation_id: ConversationId,
    pub patient_id: Option<PatientId>,
    pub job_type: JobType,
    pub manual: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True only when every sub-job succeeded.
    pub success: bool,
    pub outcomes: Vec<SubJobOutcome>,
}

impl AnalysisRunReport {
    pub fn data(&self, capability: Capability) -> Option<&serde_json::Value> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.capability == capability)
            .and_then(|outcome| match &outcome.status {
                SubJobStatus::Succeeded { data } => Some(data),
                SubJobStatus::Failed { .. } => None,
            })
    }

    pub fn failures(&self) -> impl Iterator<Item = &SubJobOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .count()
    }
}

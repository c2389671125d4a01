use serde::Serialize;
use vitals_scheduler::JobType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveAnalysis {
    #[default]
    None,
    Regular,
    Deep,
}

impl ActiveAnalysis {
    pub fn for_job(job_type: JobType) -> Self {
        match job_type {
            JobType::Regular => Self::Regular,
            JobType::Deep => Self::Deep,
            JobType::Diagnosis | JobType::Solution | JobType::Memory => Self::None,
        }
    }
}

/// What a UI needs to render the analysis indicator for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationAnalysisState {
    pub is_analyzing: bool,
    pub active_type: ActiveAnalysis,
    pub current_stage_label: Option<String>,
    pub message_count: u32,
    pub messages_until_regular: u32,
    pub messages_until_deep: u32,
    pub queued_jobs: usize,
    pub active_jobs: usize,
}

impl ConversationAnalysisState {
    pub(crate) fn new(regular_interval: u32, deep_interval: u32) -> Self {
        let mut state = Self::default();
        state.set_message_count(0, regular_interval, deep_interval);
        state
    }

    pub(crate) fn set_message_count(
        &mut self,
        message_count: u32,
        regular_interval: u32,
        deep_interval: u32,
    ) {
        self.message_count = message_count;
        self.messages_until_regular = messages_until(message_count, regular_interval);
        self.messages_until_deep = messages_until(message_count, deep_interval);
    }

    pub(crate) fn clear_activity(&mut self) {
        self.is_analyzing = false;
        self.active_type = ActiveAnalysis::None;
        self.current_stage_label = None;
    }
}

fn messages_until(message_count: u32, interval: u32) -> u32 {
    if interval == 0 {
        return 0;
    }
    interval - message_count % interval
}

/// The analysis a conversation is due for at `message_count`; deep wins ties.
pub fn due_analysis(message_count: u32, regular_interval: u32, deep_interval: u32) -> Option<JobType> {
    if message_count == 0 {
        return None;
    }
    if deep_interval > 0 && message_count % deep_interval == 0 {
        return Some(JobType::Deep);
    }
    if regular_interval > 0 && message_count % regular_interval == 0 {
        return Some(JobType::Regular);
    }
    None
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(PatientId);
id_newtype!(JobId);

impl JobId {
    /// `{conversation}:{type}:{ulid}`; the ulid keeps ids unique and time-sortable.
    pub fn generate(conversation_id: &ConversationId, job_type: JobType) -> Self {
        Self(format!(
            "{}:{}:{}",
            conversation_id,
            job_type.as_str(),
            ulid::Ulid::new()
        ))
    }
}

/// Priority of any manually forced request, regardless of type.
pub const MANUAL_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Regular,
    Deep,
    Diagnosis,
    Solution,
    Memory,
}

impl JobType {
    pub fn base_priority(self) -> u8 {
        match self {
            Self::Deep => 3,
            Self::Regular => 2,
            Self::Diagnosis | Self::Solution | Self::Memory => 1,
        }
    }

    pub fn priority(self, manual: bool) -> u8 {
        if manual {
            MANUAL_PRIORITY
        } else {
            self.base_priority()
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Deep => "deep",
            Self::Diagnosis => "diagnosis",
            Self::Solution => "solution",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub conversation_id: ConversationId,
    pub job_type: JobType,
    pub priority: u8,
    pub manual: bool,
    pub created_at: DateTime<Utc>,
    /// Arrival order; breaks ties between jobs created in the same instant.
    pub sequence: u64,
}

impl AnalysisJob {
    pub fn same_target(&self, conversation_id: &ConversationId, job_type: JobType) -> bool {
        self.job_type == job_type && &self.conversation_id == conversation_id
    }
}

/// Queue order: priority descending, then arrival ascending.
pub(crate) fn queue_order(a: &AnalysisJob, b: &AnalysisJob) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: u8, sequence: u64, created_at: DateTime<Utc>) -> AnalysisJob {
        let conversation_id = ConversationId::new("conv");
        AnalysisJob {
            id: JobId::generate(&conversation_id, JobType::Regular),
            conversation_id,
            job_type: JobType::Regular,
            priority,
            manual: false,
            created_at,
            sequence,
        }
    }

    #[test]
    fn manual_requests_outrank_every_type() {
        assert_eq!(JobType::Deep.priority(false), 3);
        assert_eq!(JobType::Regular.priority(false), 2);
        assert_eq!(JobType::Memory.priority(false), 1);
        assert_eq!(JobType::Memory.priority(true), MANUAL_PRIORITY);
        assert!(JobType::Memory.priority(true) > JobType::Deep.priority(false));
    }

    #[test]
    fn queue_order_prefers_priority_then_arrival() {
        let now = Utc::now();
        let early_low = job(1, 0, now);
        let late_high = job(3, 1, now + chrono::Duration::seconds(5));
        let same_instant_second = job(1, 2, now);
        assert_eq!(queue_order(&late_high, &early_low), Ordering::Less);
        assert_eq!(queue_order(&early_low, &same_instant_second), Ordering::Less);
    }

    #[test]
    fn job_ids_embed_target_and_stay_unique() {
        let conversation_id = ConversationId::new("conv-9");
        let a = JobId::generate(&conversation_id, JobType::Deep);
        let b = JobId::generate(&conversation_id, JobType::Deep);
        assert!(a.starts_with("conv-9:deep:"));
        assert_ne!(a, b);
        assert_eq!(
            serde_json::to_value(JobType::Diagnosis).expect("serialize job type"),
            "diagnosis"
        );
    }
}

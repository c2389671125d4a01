use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One remote analysis endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Topic and solution extraction over the whole conversation.
    TopicSolution,
    Diagnosis,
    Solution,
    Memory,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopicSolution => "topic_solution",
            Self::Diagnosis => "diagnosis",
            Self::Solution => "solution",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prioritized summary of one slice of the patient's health data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDataSummary {
    pub category: String,
    pub priority: u8,
    pub summary: String,
}

/// Extra context supplied to the topic/solution call of a deep analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeepContext {
    #[serde(default)]
    pub memory: Option<serde_json::Value>,
    #[serde(default)]
    pub strategic_reference: Vec<HealthDataSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisPayload {
    /// Full running conversation, plus deep context when the run is a deep one.
    Conversation {
        messages: Vec<ConversationMessage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<DeepContext>,
    },
    /// Only the tail of the conversation.
    RecentMessages { messages: Vec<ConversationMessage> },
    /// Identifiers only; the service loads what it needs.
    Identifiers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub capability: Capability,
    pub conversation_id: String,
    pub patient_id: String,
    pub payload: AnalysisPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

/// The last `window` messages, oldest first.
pub fn recent_window(messages: &[ConversationMessage], window: usize) -> Vec<ConversationMessage> {
    let start = messages.len().saturating_sub(window);
    messages[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recent_window_keeps_tail_in_order() {
        let messages = (0..10)
            .map(|i| ConversationMessage::user(format!("m{i}")))
            .collect::<Vec<_>>();
        let tail = recent_window(&messages, 6);
        assert_eq!(tail.len(), 6);
        assert_eq!(tail[0].content, "m4");
        assert_eq!(tail[5].content, "m9");

        let short = recent_window(&messages[..3], 6);
        assert_eq!(short.len(), 3);
    }

    #[test]
    fn conversation_payload_omits_missing_context() {
        let payload = AnalysisPayload::Conversation {
            messages: vec![ConversationMessage::user("my head hurts")],
            context: None,
        };
        let value = serde_json::to_value(&payload).expect("serialize payload");
        assert_eq!(value["type"], "conversation");
        assert!(value.get("context").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn result_defaults_missing_fields() {
        let result: AnalysisResult =
            serde_json::from_value(json!({ "success": false })).expect("parse result");
        assert!(!result.success);
        assert!(result.data.is_null());
        assert!(result.error.is_none());
    }
}

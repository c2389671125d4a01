//! Where the orchestrator reads conversation context from.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use vitals_analysis::{ConversationMessage, HealthDataSummary};
use vitals_scheduler::{ConversationId, PatientId};

#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub patient_id: PatientId,
    pub messages: Vec<ConversationMessage>,
}

#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// Patient and full message history, oldest first.
    async fn snapshot(&self, conversation_id: &ConversationId) -> Result<ConversationSnapshot>;

    /// Conversation memory supplied to deep analysis.
    async fn memory(
        &self,
        _conversation_id: &ConversationId,
        _patient_id: &PatientId,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Prioritized health-data summaries supplied to deep analysis.
    async fn strategic_reference(&self, _patient_id: &PatientId) -> Result<Vec<HealthDataSummary>> {
        Ok(Vec::new())
    }
}

/// Process-local conversation store.
#[derive(Default)]
pub struct InMemoryConversations {
    conversations: DashMap<ConversationId, ConversationSnapshot>,
    memories: DashMap<ConversationId, serde_json::Value>,
    references: DashMap<PatientId, Vec<HealthDataSummary>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return the new message count.
    pub fn append(
        &self,
        conversation_id: &ConversationId,
        patient_id: &PatientId,
        message: ConversationMessage,
    ) -> u32 {
        let mut entry = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationSnapshot {
                patient_id: patient_id.clone(),
                messages: Vec::new(),
            });
        entry.messages.push(message);
        entry.messages.len() as u32
    }

    /// Message history, oldest first; empty for an unknown conversation.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<ConversationMessage> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    pub fn set_memory(&self, conversation_id: &ConversationId, memory: serde_json::Value) {
        self.memories.insert(conversation_id.clone(), memory);
    }

    pub fn set_strategic_reference(&self, patient_id: &PatientId, summaries: Vec<HealthDataSummary>) {
        self.references.insert(patient_id.clone(), summaries);
    }

    pub fn remove(&self, conversation_id: &ConversationId) -> bool {
        self.memories.remove(conversation_id);
        self.conversations.remove(conversation_id).is_some()
    }
}

#[async_trait]
impl ConversationSource for InMemoryConversations {
    async fn snapshot(&self, conversation_id: &ConversationId) -> Result<ConversationSnapshot> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("unknown conversation: {conversation_id}"))
    }

    async fn memory(
        &self,
        conversation_id: &ConversationId,
        _patient_id: &PatientId,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .memories
            .get(conversation_id)
            .map(|entry| entry.value().clone()))
    }

    async fn strategic_reference(&self, patient_id: &PatientId) -> Result<Vec<HealthDataSummary>> {
        Ok(self
            .references
            .get(patient_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_counts_messages_per_conversation() {
        let store = InMemoryConversations::new();
        let conv = ConversationId::new("c1");
        let patient = PatientId::new("p1");
        assert_eq!(store.append(&conv, &patient, ConversationMessage::user("hi")), 1);
        assert_eq!(
            store.append(&conv, &patient, ConversationMessage::assistant("hello")),
            2
        );

        let snapshot = store.snapshot(&conv).await.expect("snapshot");
        assert_eq!(snapshot.patient_id, patient);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(store.messages(&conv)[1].content, "hello");
        assert!(store.memory(&conv, &patient).await.expect("memory").is_none());

        assert!(store.remove(&conv));
        let err = store.snapshot(&conv).await.expect_err("removed conversation");
        assert!(err.to_string().contains("unknown conversation"));
    }
}

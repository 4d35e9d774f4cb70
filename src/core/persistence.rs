//! Conversation persistence seam.
//!
//! Sessions hand transcript lines and one call summary to a
//! [`ConversationStore`]. The default store writes them to the log; a
//! database-backed store plugs in behind the same trait.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::convai::UtteranceRole;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// One line of conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtteranceRecord {
    pub role: UtteranceRole,
    pub text: String,
    pub call_sid: String,
    pub external_ref_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Summary written once per finished call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub stream_sid: String,
    pub call_sid: String,
    pub external_ref_id: Option<String>,
    pub agent_id: String,
    pub conversation_id: Option<String>,
    pub duration_secs: u64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn record_utterance(&self, record: UtteranceRecord) -> PersistenceResult<()>;

    async fn record_call(&self, record: CallRecord) -> PersistenceResult<()>;
}

/// Writes records to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConversationStore;

#[async_trait]
impl ConversationStore for LogConversationStore {
    async fn record_utterance(&self, record: UtteranceRecord) -> PersistenceResult<()> {
        info!(
            role = %record.role,
            call_sid = %record.call_sid,
            external_ref_id = record.external_ref_id.as_deref().unwrap_or("-"),
            conversation_id = record.conversation_id.as_deref().unwrap_or("-"),
            "{}: {}",
            record.role,
            record.text
        );
        Ok(())
    }

    async fn record_call(&self, record: CallRecord) -> PersistenceResult<()> {
        info!(
            stream_sid = %record.stream_sid,
            call_sid = %record.call_sid,
            agent_id = %record.agent_id,
            external_ref_id = record.external_ref_id.as_deref().unwrap_or("-"),
            conversation_id = record.conversation_id.as_deref().unwrap_or("-"),
            duration_secs = record.duration_secs,
            "Call recorded"
        );
        Ok(())
    }
}

/// Keeps records in memory. Useful for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    utterances: Mutex<Vec<UtteranceRecord>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn utterances(&self) -> Vec<UtteranceRecord> {
        self.utterances.lock().await.clone()
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn record_utterance(&self, record: UtteranceRecord) -> PersistenceResult<()> {
        self.utterances.lock().await.push(record);
        Ok(())
    }

    async fn record_call(&self, record: CallRecord) -> PersistenceResult<()> {
        self.calls.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str) -> UtteranceRecord {
        UtteranceRecord {
            role: UtteranceRole::User,
            text: text.to_string(),
            call_sid: "CA1".to_string(),
            external_ref_id: Some("ref".to_string()),
            conversation_id: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_keeps_order() {
        let store = MemoryConversationStore::new();
        store.record_utterance(utterance("one")).await.unwrap();
        store.record_utterance(utterance("two")).await.unwrap();

        let texts: Vec<String> = store
            .utterances()
            .await
            .into_iter()
            .map(|u| u.text)
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_store_accepts_records() {
        let store = LogConversationStore;
        assert!(store.record_utterance(utterance("hi")).await.is_ok());
        assert!(
            store
                .record_call(CallRecord {
                    stream_sid: "MZ1".to_string(),
                    call_sid: "CA1".to_string(),
                    external_ref_id: None,
                    agent_id: "agent".to_string(),
                    conversation_id: Some("conv".to_string()),
                    duration_secs: 3,
                })
                .await
                .is_ok()
        );
    }

    #[test]
    fn test_utterance_record_serializes_role() {
        let json = serde_json::to_value(utterance("hi")).unwrap();
        assert_eq!(json["role"], "user");
    }
}

use super::{
    Metadata, SessionDetails, SessionId, SessionPage, SessionRecord, SessionRecordStore, SessionStatus,
    SessionUpdate, TranscriptId, TranscriptRecord,
};
use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    transcripts: HashMap<SessionId, TranscriptRecord>,
}

/// Session store backed by in-process maps.
#[derive(Default)]
pub struct MemorySessionStore {
    tables: RwLock<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn details(&self, session: &SessionRecord) -> SessionDetails {
        SessionDetails {
            session: session.clone(),
            transcripts: self.transcripts.get(&session.id).cloned().into_iter().collect(),
        }
    }
}

#[async_trait]
impl SessionRecordStore for MemorySessionStore {
    async fn create_session(&self, metadata: Metadata) -> Result<SessionId, PersistenceError> {
        let id = Uuid::new_v4();
        let record = SessionRecord {
            id,
            created_at: Utc::now(),
            updated_at: None,
            duration_seconds: None,
            word_count: 0,
            status: SessionStatus::InProgress,
            metadata,
        };
        self.tables.write().await.sessions.insert(id, record);
        Ok(id)
    }

    async fn append_transcript(
        &self,
        session_id: SessionId,
        text: &str,
        confidence: Option<f32>,
    ) -> Result<TranscriptId, PersistenceError> {
        if text.trim().is_empty() {
            return Err(PersistenceError::EmptyTranscript);
        }

        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(PersistenceError::NotFound(session_id));
        }
        if tables.transcripts.contains_key(&session_id) {
            return Err(PersistenceError::TranscriptExists(session_id));
        }

        let id = Uuid::new_v4();
        tables.transcripts.insert(
            session_id,
            TranscriptRecord {
                id,
                session_id,
                transcript_text: text.to_string(),
                confidence,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update_session(&self, session_id: SessionId, update: SessionUpdate) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .sessions
            .get_mut(&session_id)
            .ok_or(PersistenceError::NotFound(session_id))?;

        if !record.status.can_transition_to(update.status) {
            return Err(PersistenceError::InvalidTransition {
                id: session_id,
                from: record.status,
                to: update.status,
            });
        }

        record.status = update.status;
        if let Some(duration) = update.duration_seconds {
            record.duration_seconds = Some(duration);
        }
        if let Some(words) = update.word_count {
            record.word_count = words;
        }
        record.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn list_sessions(&self, skip: u64, limit: u64) -> Result<SessionPage, PersistenceError> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<&SessionRecord> = tables.sessions.values().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(SessionPage {
            total: sessions.len() as u64,
            sessions: sessions
                .into_iter()
                .skip(skip as usize)
                .take(limit as usize)
                .map(|s| tables.details(s))
                .collect(),
        })
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDetails, PersistenceError> {
        let tables = self.tables.read().await;
        tables
            .sessions
            .get(&session_id)
            .map(|s| tables.details(s))
            .ok_or(PersistenceError::NotFound(session_id))
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        let mut tables = self.tables.write().await;
        tables
            .sessions
            .remove(&session_id)
            .ok_or(PersistenceError::NotFound(session_id))?;
        tables.transcripts.remove(&session_id);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> Metadata {
        let mut m = Metadata::new();
        m.insert("started_at".to_string(), json!("2025-01-01T00:00:00Z"));
        m
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = MemorySessionStore::new();
        let id = store.create_session(metadata()).await.unwrap();

        let details = store.get_session(id).await.unwrap();
        assert_eq!(details.session.status, SessionStatus::InProgress);
        assert_eq!(details.session.word_count, 0);
        assert!(details.session.duration_seconds.is_none());

        store.append_transcript(id, "hello world", Some(0.8)).await.unwrap();
        store
            .update_session(id, SessionUpdate::completed(2.5, 2))
            .await
            .unwrap();

        let details = store.get_session(id).await.unwrap();
        assert_eq!(details.session.status, SessionStatus::Completed);
        assert_eq!(details.session.word_count, 2);
        assert_eq!(details.session.duration_seconds, Some(2.5));
        assert!(details.session.updated_at.is_some());
        assert_eq!(details.transcripts.len(), 1);
        assert_eq!(details.transcripts[0].transcript_text, "hello world");
    }

    #[tokio::test]
    async fn test_invariants_enforced() {
        let store = MemorySessionStore::new();
        let id = store.create_session(Metadata::new()).await.unwrap();

        assert!(matches!(
            store.append_transcript(id, "  ", None).await,
            Err(PersistenceError::EmptyTranscript)
        ));

        store.append_transcript(id, "one", None).await.unwrap();
        assert!(matches!(
            store.append_transcript(id, "two", None).await,
            Err(PersistenceError::TranscriptExists(_))
        ));

        store.update_session(id, SessionUpdate::failed(1.0, 1)).await.unwrap();
        assert!(matches!(
            store.update_session(id, SessionUpdate::completed(1.0, 1)).await,
            Err(PersistenceError::InvalidTransition { .. })
        ));

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.update_session(missing, SessionUpdate::completed(0.0, 0)).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = MemorySessionStore::new();
        let first = store.create_session(Metadata::new()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store.create_session(Metadata::new()).await.unwrap();
        store.append_transcript(first, "kept", None).await.unwrap();

        let page = store.list_sessions(0, 100).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.sessions[0].session.id, second);

        let page = store.list_sessions(1, 1).await.unwrap();
        assert_eq!(page.sessions.len(), 1);
        assert_eq!(page.sessions[0].session.id, first);
        assert_eq!(page.sessions[0].transcripts.len(), 1);

        store.delete_session(first).await.unwrap();
        assert!(matches!(store.get_session(first).await, Err(PersistenceError::NotFound(_))));
        assert!(matches!(store.delete_session(first).await, Err(PersistenceError::NotFound(_))));
        assert_eq!(store.list_sessions(0, 100).await.unwrap().total, 1);
    }
}

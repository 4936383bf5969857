//! # Session Record Storage
//!
//! Durable records of transcription sessions and their transcripts.
//!
//! ## Records:
//! - **Session**: one per started connection, created `in_progress` and
//!   moved exactly once to `completed` or `failed`
//! - **Transcript**: at most one per session, written only when the final
//!   text is non-empty, never modified afterwards
//!
//! The session controller only uses `create_session`, `append_transcript`
//! and `update_session`; the REST handlers use the listing side.
//!
//! ## Backends:
//! - [`SqliteSessionStore`]: sqlx over a SQLite pool (the default)
//! - [`MemorySessionStore`]: in-process maps, selected with `database.url = "memory"`

pub mod memory;
pub mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use crate::config::DatabaseConfig;
use crate::error::PersistenceError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type TranscriptId = Uuid;

/// Free-form JSON attached to a session when it starts.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Sessions only ever leave `in_progress`, and only once.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::InProgress, SessionStatus::Completed)
                | (SessionStatus::InProgress, SessionStatus::Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(PersistenceError::Corrupt(format!("unknown session status '{}'", other))),
        }
    }
}

/// The terminal write for a session: its new status plus the figures that
/// are only known once it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub status: SessionStatus,
    pub duration_seconds: Option<f64>,
    pub word_count: Option<u32>,
}

impl SessionUpdate {
    pub fn completed(duration_seconds: f64, word_count: u32) -> Self {
        Self {
            status: SessionStatus::Completed,
            duration_seconds: Some(duration_seconds),
            word_count: Some(word_count),
        }
    }

    pub fn failed(duration_seconds: f64, word_count: u32) -> Self {
        Self {
            status: SessionStatus::Failed,
            duration_seconds: Some(duration_seconds),
            word_count: Some(word_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub word_count: u32,
    pub status: SessionStatus,
    #[serde(rename = "session_metadata")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptRecord {
    pub id: TranscriptId,
    pub session_id: SessionId,
    pub transcript_text: String,
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

/// A session together with its transcripts, as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub transcripts: Vec<TranscriptRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionPage {
    pub total: u64,
    pub sessions: Vec<SessionDetails>,
}

/// Persistence for sessions and transcripts.
///
/// Implementations enforce the record invariants themselves: unknown ids
/// are `NotFound`, status changes other than `in_progress -> completed|failed`
/// are `InvalidTransition`, empty transcripts are `EmptyTranscript`, and a
/// second transcript for the same session is `TranscriptExists`.
#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    /// Create an `in_progress` session and return its new id.
    async fn create_session(&self, metadata: Metadata) -> Result<SessionId, PersistenceError>;

    async fn append_transcript(
        &self,
        session_id: SessionId,
        text: &str,
        confidence: Option<f32>,
    ) -> Result<TranscriptId, PersistenceError>;

    async fn update_session(&self, session_id: SessionId, update: SessionUpdate) -> Result<(), PersistenceError>;

    /// Newest sessions first.
    async fn list_sessions(&self, skip: u64, limit: u64) -> Result<SessionPage, PersistenceError>;

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDetails, PersistenceError>;

    /// Delete a session and its transcripts.
    async fn delete_session(&self, session_id: SessionId) -> Result<(), PersistenceError>;

    /// Short backend name for health output.
    fn backend(&self) -> &'static str;
}

/// Open the store selected by `database.url`.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn SessionRecordStore>> {
    if config.url == "memory" {
        info!("Using in-memory session store; records are lost on restart");
        return Ok(Arc::new(MemorySessionStore::new()));
    }

    let store = SqliteSessionStore::connect(&config.url, config.max_connections).await?;
    info!("Connected session store at {}", config.url);
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("completed".parse::<SessionStatus>().unwrap(), SessionStatus::Completed);
        assert!("done".parse::<SessionStatus>().is_err());
        assert_eq!(SessionStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_details_serialize_flat() {
        let id = Uuid::new_v4();
        let details = SessionDetails {
            session: SessionRecord {
                id,
                created_at: Utc::now(),
                updated_at: None,
                duration_seconds: None,
                word_count: 0,
                status: SessionStatus::InProgress,
                metadata: Metadata::new(),
            },
            transcripts: Vec::new(),
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["id"], json!(id.to_string()));
        assert_eq!(value["status"], json!("in_progress"));
        assert_eq!(value["session_metadata"], json!({}));
        assert_eq!(value["transcripts"], json!([]));
    }
}

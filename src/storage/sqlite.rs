use super::{
    Metadata, SessionDetails, SessionId, SessionPage, SessionRecord, SessionRecordStore, SessionStatus,
    SessionUpdate, TranscriptId, TranscriptRecord,
};
use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        duration_seconds REAL,
        word_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'in_progress',
        session_metadata TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS transcripts (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        transcript_text TEXT NOT NULL,
        confidence REAL,
        created_at TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transcripts_session ON transcripts(session_id)",
];

type SessionRow = (String, String, Option<String>, Option<f64>, i64, String, String);
type TranscriptRow = (String, String, String, Option<f64>, String);

const SESSION_COLUMNS: &str =
    "id, created_at, updated_at, duration_seconds, word_count, status, session_metadata";

/// Session store on a SQLite database.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `url` and make sure the
    /// schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` gets its own database, so keep
        // exactly one alive for the lifetime of the pool.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Session store schema ready");
        Ok(())
    }

    async fn current_status(&self, session_id: SessionId) -> Result<SessionStatus, PersistenceError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((status,)) => status.parse(),
            None => Err(PersistenceError::NotFound(session_id)),
        }
    }

    async fn transcripts_for(&self, session_id: SessionId) -> Result<Vec<TranscriptRecord>, PersistenceError> {
        let rows: Vec<TranscriptRow> = sqlx::query_as(
            "SELECT id, session_id, transcript_text, confidence, created_at
             FROM transcripts WHERE session_id = ? ORDER BY created_at",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transcript_from_row).collect()
    }

    async fn details(&self, session: SessionRecord) -> Result<SessionDetails, PersistenceError> {
        let transcripts = self.transcripts_for(session.id).await?;
        Ok(SessionDetails { session, transcripts })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so that text ordering matches time ordering
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_id(raw: &str) -> Result<Uuid, PersistenceError> {
    Uuid::parse_str(raw).map_err(|e| PersistenceError::Corrupt(format!("bad id '{}': {}", raw, e)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn session_from_row(row: SessionRow) -> Result<SessionRecord, PersistenceError> {
    let (id, created_at, updated_at, duration_seconds, word_count, status, metadata) = row;
    let metadata: Metadata = serde_json::from_str(&metadata)
        .map_err(|e| PersistenceError::Corrupt(format!("bad session metadata: {}", e)))?;

    Ok(SessionRecord {
        id: parse_id(&id)?,
        created_at: parse_time(&created_at)?,
        updated_at: updated_at.as_deref().map(parse_time).transpose()?,
        duration_seconds,
        word_count: u32::try_from(word_count)
            .map_err(|_| PersistenceError::Corrupt(format!("bad word count {}", word_count)))?,
        status: status.parse()?,
        metadata,
    })
}

fn transcript_from_row(row: TranscriptRow) -> Result<TranscriptRecord, PersistenceError> {
    let (id, session_id, transcript_text, confidence, created_at) = row;
    Ok(TranscriptRecord {
        id: parse_id(&id)?,
        session_id: parse_id(&session_id)?,
        transcript_text,
        confidence: confidence.map(|c| c as f32),
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl SessionRecordStore for SqliteSessionStore {
    async fn create_session(&self, metadata: Metadata) -> Result<SessionId, PersistenceError> {
        let id = Uuid::new_v4();
        let metadata = serde_json::Value::Object(metadata).to_string();

        sqlx::query(
            "INSERT INTO sessions (id, created_at, word_count, status, session_metadata)
             VALUES (?, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(timestamp(Utc::now()))
        .bind(SessionStatus::InProgress.as_str())
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        debug!(session_id = %id, "Created session record");
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
        self.current_status(session_id).await?;

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO transcripts (id, session_id, transcript_text, confidence, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(session_id.to_string())
        .bind(text)
        .bind(confidence.map(f64::from))
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(session_id = %session_id, transcript_id = %id, "Stored transcript");
                Ok(id)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(PersistenceError::TranscriptExists(session_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_session(&self, session_id: SessionId, update: SessionUpdate) -> Result<(), PersistenceError> {
        if update.status == SessionStatus::InProgress {
            let from = self.current_status(session_id).await?;
            return Err(PersistenceError::InvalidTransition {
                id: session_id,
                from,
                to: update.status,
            });
        }

        let result = sqlx::query(
            "UPDATE sessions
             SET status = ?,
                 duration_seconds = COALESCE(?, duration_seconds),
                 word_count = COALESCE(?, word_count),
                 updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(update.status.as_str())
        .bind(update.duration_seconds)
        .bind(update.word_count.map(i64::from))
        .bind(timestamp(Utc::now()))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the row is gone or it already left in_progress
            let from = self.current_status(session_id).await?;
            return Err(PersistenceError::InvalidTransition {
                id: session_id,
                from,
                to: update.status,
            });
        }

        debug!(session_id = %session_id, status = %update.status, "Updated session record");
        Ok(())
    }

    async fn list_sessions(&self, skip: u64, limit: u64) -> Result<SessionPage, PersistenceError> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC LIMIT ? OFFSET ?",
            SESSION_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.details(session_from_row(row)?).await?);
        }

        Ok(SessionPage {
            total: total.max(0) as u64,
            sessions,
        })
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDetails, PersistenceError> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
                .bind(session_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => self.details(session_from_row(row)?).await,
            None => Err(PersistenceError::NotFound(session_id)),
        }
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM transcripts WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(session_id));
        }

        tx.commit().await?;
        debug!(session_id = %session_id, "Deleted session record");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

//! # Transcription Session State Machine
//!
//! One controller per connection, driven by one message at a time:
//!
//! ```text
//! Created --start--> Active --stop / connection lost--> Finalizing --> Closed(Completed)
//!                      |                                    |     \--> Closed(CompletedUnpersisted)
//!                      \--engine error--> Closed(Failed) <--/ (flush error, storage timeout)
//! ```
//!
//! The controller owns the session's recognizer. Frames are fed on the
//! blocking pool, one at a time, and the recognizer is flushed exactly once
//! when the session ends, within `session.flush_timeout_ms`. Session records
//! are written at start and at the end, each round bounded by
//! `session.finalize_timeout_ms`.

use super::transcript::{AccumulatedTranscript, TranscriptSummary};
use crate::audio::{AudioFrameProcessor, AudioPayload, PcmFrame};
use crate::config::AppConfig;
use crate::error::{EngineError, PersistenceError, SessionError};
use crate::protocol::ServerMessage;
use crate::storage::{Metadata, SessionId, SessionRecordStore, SessionUpdate};
use crate::transcription::{FinalHypothesis, RecognitionEngine, RecognitionResult, Recognizer};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Upper bound on each round of session-record writes.
    pub persistence_timeout: Duration,
    /// Upper bound on the recognizer's closing flush.
    pub flush_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            persistence_timeout: config.session.finalize_timeout(),
            flush_timeout: config.session.flush_timeout(),
        }
    }
}

/// How a closed session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Transcript and status were recorded.
    Completed,
    /// Recognition finished but the records could not be written; the
    /// stored session may still read `in_progress`.
    CompletedUnpersisted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Active,
    Finalizing,
    Closed(SessionOutcome),
}

struct ActiveSession {
    session_id: SessionId,
    started: Instant,
    /// `None` only while a frame is being processed on the blocking pool.
    recognizer: Option<Box<dyn Recognizer>>,
    transcript: AccumulatedTranscript,
}

enum State {
    Created,
    Active(ActiveSession),
    Finalizing,
    Closed(SessionOutcome),
}

pub struct TranscriptionSessionController {
    engine: Arc<dyn RecognitionEngine>,
    store: Arc<dyn SessionRecordStore>,
    processor: AudioFrameProcessor,
    settings: SessionSettings,
    session_id: Option<SessionId>,
    state: State,
}

impl TranscriptionSessionController {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        store: Arc<dyn SessionRecordStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            engine,
            store,
            processor: AudioFrameProcessor::new(settings.sample_rate, settings.channels),
            settings,
            session_id: None,
            state: State::Created,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            State::Created => SessionPhase::Created,
            State::Active(_) => SessionPhase::Active,
            State::Finalizing => SessionPhase::Finalizing,
            State::Closed(outcome) => SessionPhase::Closed(*outcome),
        }
    }

    /// How the session ended, once it is closed.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.state {
            State::Closed(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Begin the session: create a recognizer and an `in_progress` record.
    ///
    /// On failure nothing is kept and the controller can be started again.
    pub async fn start(&mut self, mut metadata: Metadata) -> Result<ServerMessage, SessionError> {
        if !matches!(self.state, State::Created) {
            return Err(SessionError::AlreadyStarted);
        }

        let recognizer = self.engine.create_recognizer(self.settings.sample_rate)?;

        metadata.insert("started_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        let session_id = within(self.settings.persistence_timeout, self.store.create_session(metadata)).await?;

        info!(%session_id, "Transcription session started");
        self.session_id = Some(session_id);
        self.state = State::Active(ActiveSession {
            session_id,
            started: Instant::now(),
            recognizer: Some(recognizer),
            transcript: AccumulatedTranscript::default(),
        });

        Ok(ServerMessage::SessionStarted { session_id })
    }

    /// Handle one audio payload and return the messages it produced.
    pub async fn audio(&mut self, payload: AudioPayload) -> Vec<ServerMessage> {
        if !matches!(self.state, State::Active(_)) {
            debug!(phase = ?self.phase(), "Ignoring audio outside an active session");
            return Vec::new();
        }

        let frame = match self.processor.decode(&payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session_id = ?self.session_id, %err, "Dropping undecodable audio frame");
                return vec![ServerMessage::error(format!("Invalid audio data: {}", err))];
            }
        };

        if !self
            .processor
            .validate(&frame, self.settings.sample_rate, self.settings.channels)
        {
            return vec![ServerMessage::error("Invalid audio format")];
        }

        let State::Active(active) = &mut self.state else {
            return Vec::new();
        };
        let result = match active.recognizer.take() {
            Some(recognizer) => {
                let (recognizer, result) = feed_blocking(recognizer, frame).await;
                active.recognizer = recognizer;
                result
            }
            None => Err(EngineError::RecognizerLost),
        };

        match result {
            Ok(RecognitionResult::Partial { text }) => vec![ServerMessage::Partial { text }],
            Ok(RecognitionResult::Final(hypothesis)) => match active.transcript.record(&hypothesis) {
                Some(text) => vec![ServerMessage::FinalChunk {
                    text,
                    confidence: hypothesis.chunk_confidence(),
                }],
                None => Vec::new(),
            },
            Err(err) => match self.take_active() {
                Some(active) => self.abort(active, err).await,
                None => Vec::new(),
            },
        }
    }

    /// Finish the session on the client's request.
    pub async fn stop(&mut self) -> Result<Vec<ServerMessage>, SessionError> {
        match self.state {
            State::Created => Err(SessionError::NotStarted),
            State::Finalizing | State::Closed(_) => Err(SessionError::AlreadyClosed),
            State::Active(_) => Ok(self.finalize().await),
        }
    }

    /// Finish the session after the transport went away. Nothing is sent.
    pub async fn connection_lost(&mut self) {
        let session_id = match &self.state {
            State::Active(active) => active.session_id,
            _ => return,
        };
        info!(%session_id, "Connection lost, finalizing session");
        self.finalize().await;
    }

    fn take_active(&mut self) -> Option<ActiveSession> {
        match std::mem::replace(&mut self.state, State::Finalizing) {
            State::Active(active) => Some(active),
            other => {
                self.state = other;
                None
            }
        }
    }

    async fn finalize(&mut self) -> Vec<ServerMessage> {
        let Some(mut active) = self.take_active() else {
            return Vec::new();
        };

        let trailing = match active.recognizer.take() {
            Some(recognizer) => flush_blocking(recognizer, self.settings.flush_timeout).await,
            None => Err(EngineError::RecognizerLost),
        };
        match trailing {
            Ok(hypothesis) => {
                active.transcript.record(&hypothesis);
            }
            Err(err) => return self.abort(active, err).await,
        }

        let session_id = active.session_id;
        let summary = active.transcript.summarize(active.started.elapsed());
        let outcome = self.record_completion(session_id, &summary).await;
        self.state = State::Closed(outcome);

        info!(
            %session_id,
            ?outcome,
            word_count = summary.word_count,
            duration = summary.duration_seconds,
            "Transcription session finished"
        );

        let mut messages = Vec::with_capacity(2);
        match outcome {
            SessionOutcome::Completed => {}
            SessionOutcome::CompletedUnpersisted => {
                messages.push(ServerMessage::error("Transcript could not be saved"));
            }
            SessionOutcome::Failed => {
                messages.push(ServerMessage::error("Timed out saving transcript"));
            }
        }
        messages.push(summary.to_message());
        messages
    }

    /// Write the transcript (if any) and then the terminal status.
    async fn record_completion(&mut self, session_id: SessionId, summary: &TranscriptSummary) -> SessionOutcome {
        let store = &self.store;
        let writes = async {
            if !summary.text.is_empty() {
                store
                    .append_transcript(session_id, &summary.text, summary.confidence)
                    .await?;
            }
            store
                .update_session(
                    session_id,
                    SessionUpdate::completed(summary.duration_seconds, summary.word_count),
                )
                .await
        };

        match within(self.settings.persistence_timeout, writes).await {
            Ok(()) => SessionOutcome::Completed,
            Err(PersistenceError::Timeout(ms)) => {
                error!(%session_id, timeout_ms = ms, "Session records not written in time; marking session failed");
                SessionOutcome::Failed
            }
            Err(err) => {
                error!(
                    %session_id,
                    %err,
                    "Failed to record finished session; stored status may remain in_progress"
                );
                SessionOutcome::CompletedUnpersisted
            }
        }
    }

    /// Fail the session after an engine error and release its recognizer.
    async fn abort(&mut self, active: ActiveSession, err: EngineError) -> Vec<ServerMessage> {
        let ActiveSession {
            session_id,
            started,
            recognizer,
            transcript,
        } = active;
        drop(recognizer);
        error!(%session_id, %err, "Recognition failed, aborting session");

        let summary = transcript.summarize(started.elapsed());
        let update = SessionUpdate::failed(summary.duration_seconds, summary.word_count);
        if let Err(persist_err) =
            within(self.settings.persistence_timeout, self.store.update_session(session_id, update)).await
        {
            error!(%session_id, err = %persist_err, "Failed to mark session as failed");
        }

        self.state = State::Closed(SessionOutcome::Failed);
        vec![ServerMessage::error(format!("Recognition failed: {}", err))]
    }
}

async fn within<T, F>(limit: Duration, write: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout(limit.as_millis())),
    }
}

/// Run `feed` on the blocking pool. The recognizer comes back unless the
/// task panicked.
async fn feed_blocking(
    mut recognizer: Box<dyn Recognizer>,
    frame: PcmFrame,
) -> (Option<Box<dyn Recognizer>>, Result<RecognitionResult, EngineError>) {
    let task = tokio::task::spawn_blocking(move || {
        let result = recognizer.feed(&frame);
        (recognizer, result)
    });
    match task.await {
        Ok((recognizer, result)) => (Some(recognizer), result),
        Err(join_err) => (None, Err(EngineError::Task(join_err.to_string()))),
    }
}

/// Run `flush` on the blocking pool. A flush that outlives `limit` keeps
/// its thread until it returns, but its result is discarded.
async fn flush_blocking(recognizer: Box<dyn Recognizer>, limit: Duration) -> Result<FinalHypothesis, EngineError> {
    let task = tokio::task::spawn_blocking(move || recognizer.flush());
    match tokio::time::timeout(limit, task).await {
        Ok(joined) => joined.map_err(|join_err| EngineError::Task(join_err.to_string()))?,
        Err(_) => Err(EngineError::FlushTimeout(limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySessionStore, SessionStatus};
    use crate::testing::{final_step, hypothesis, partial, speech, Fault, FaultyStore, ScriptedEngine, Step};
    use std::sync::atomic::Ordering;

    fn settings() -> SessionSettings {
        SessionSettings {
            sample_rate: 16000,
            channels: 1,
            persistence_timeout: Duration::from_millis(200),
            flush_timeout: Duration::from_millis(200),
        }
    }

    fn controller(
        engine: Arc<ScriptedEngine>,
        store: Arc<dyn SessionRecordStore>,
    ) -> TranscriptionSessionController {
        TranscriptionSessionController::new(engine, store, settings())
    }

    fn audio() -> AudioPayload {
        AudioPayload::Base64(speech(1600))
    }

    #[tokio::test]
    async fn test_full_session() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![
                partial("hel"),
                final_step("hello world", &[Some(0.9), Some(0.7)]),
                final_step("  ", &[]),
                final_step("again", &[None]),
            ],
            hypothesis("goodbye", &[Some(0.8)]),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store.clone());

        let started = session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();
        assert_eq!(started, ServerMessage::SessionStarted { session_id });
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(session.outcome(), None);

        assert_eq!(
            session.audio(audio()).await,
            vec![ServerMessage::Partial { text: "hel".to_string() }]
        );

        let chunk = session.audio(audio()).await;
        match &chunk[..] {
            [ServerMessage::FinalChunk { text, confidence }] => {
                assert_eq!(text, "hello world");
                assert!((confidence.unwrap() - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected messages {:?}", other),
        }

        // Whitespace-only finals are not emitted
        assert!(session.audio(audio()).await.is_empty());

        assert_eq!(
            session.audio(audio()).await,
            vec![ServerMessage::FinalChunk {
                text: "again".to_string(),
                confidence: None,
            }]
        );

        let messages = session.stop().await.unwrap();
        match &messages[..] {
            [ServerMessage::Final {
                text,
                word_count,
                confidence,
                ..
            }] => {
                assert_eq!(text, "hello world again goodbye");
                assert_eq!(*word_count, 4);
                assert!((confidence.unwrap() - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected messages {:?}", other),
        }
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Completed));
        assert_eq!(session.outcome(), Some(SessionOutcome::Completed));
        assert_eq!(engine.flushed.load(Ordering::SeqCst), 1);

        let record = store.get_session(session_id).await.unwrap();
        assert_eq!(record.session.status, SessionStatus::Completed);
        assert_eq!(record.session.word_count, 4);
        assert!(record.session.duration_seconds.is_some());
        assert!(record.session.metadata.contains_key("started_at"));
        assert_eq!(record.transcripts.len(), 1);
        assert_eq!(record.transcripts[0].transcript_text, "hello world again goodbye");
    }

    #[tokio::test]
    async fn test_final_text_matches_chunks() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![final_step(" one ", &[]), partial("tw"), final_step("two three", &[])],
            FinalHypothesis::empty(),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine, store);
        session.start(Metadata::new()).await.unwrap();

        let mut chunks = Vec::new();
        for _ in 0..3 {
            for message in session.audio(audio()).await {
                if let ServerMessage::FinalChunk { text, .. } = message {
                    chunks.push(text);
                }
            }
        }

        let messages = session.stop().await.unwrap();
        let Some(ServerMessage::Final { text, .. }) = messages.last() else {
            panic!("no final message in {:?}", messages);
        };
        assert_eq!(*text, chunks.join(" "));
    }

    #[tokio::test]
    async fn test_empty_session_completes_without_transcript() {
        let engine = Arc::new(ScriptedEngine::silent());
        let store = Arc::new(FaultyStore::new(Fault::None));
        let mut session = controller(engine, store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();

        let messages = session.stop().await.unwrap();
        match &messages[..] {
            [ServerMessage::Final {
                text,
                word_count,
                confidence,
                ..
            }] => {
                assert_eq!(text, "");
                assert_eq!(*word_count, 0);
                assert!(confidence.is_none());
            }
            other => panic!("unexpected messages {:?}", other),
        }

        assert_eq!(store.appends.load(Ordering::SeqCst), 0);
        let record = store.get_session(session_id).await.unwrap();
        assert_eq!(record.session.status, SessionStatus::Completed);
        assert_eq!(record.session.word_count, 0);
        assert!(record.transcripts.is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_writes_nothing() {
        let engine = Arc::new(ScriptedEngine::silent());
        let store = Arc::new(FaultyStore::new(Fault::None));
        let mut session = controller(engine.clone(), store.clone());

        assert!(matches!(session.stop().await, Err(SessionError::NotStarted)));
        assert_eq!(session.phase(), SessionPhase::Created);
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
        assert_eq!(store.list_sessions(0, 10).await.unwrap().total, 0);
        assert_eq!(engine.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_start_and_second_stop_rejected() {
        let engine = Arc::new(ScriptedEngine::silent());
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store.clone());

        session.start(Metadata::new()).await.unwrap();
        assert!(matches!(
            session.start(Metadata::new()).await,
            Err(SessionError::AlreadyStarted)
        ));
        assert_eq!(store.list_sessions(0, 10).await.unwrap().total, 1);

        session.stop().await.unwrap();
        assert!(matches!(session.stop().await, Err(SessionError::AlreadyClosed)));
        assert_eq!(engine.flushed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_audio_outside_active_is_ignored() {
        let engine = Arc::new(ScriptedEngine::new(vec![partial("x")], FinalHypothesis::empty()));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store);

        assert!(session.audio(audio()).await.is_empty());
        session.start(Metadata::new()).await.unwrap();
        session.stop().await.unwrap();
        assert!(session.audio(audio()).await.is_empty());
        assert_eq!(engine.fed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_audio_reports_error_and_continues() {
        let engine = Arc::new(ScriptedEngine::new(vec![partial("ok")], FinalHypothesis::empty()));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store);
        session.start(Metadata::new()).await.unwrap();

        let messages = session.audio(AudioPayload::Base64("%%%".to_string())).await;
        assert!(matches!(&messages[..], [ServerMessage::Error { .. }]));
        let messages = session.audio(AudioPayload::Pcm(vec![1, 2, 3])).await;
        assert!(matches!(&messages[..], [ServerMessage::Error { .. }]));
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(engine.fed.load(Ordering::SeqCst), 0);

        assert_eq!(
            session.audio(audio()).await,
            vec![ServerMessage::Partial { text: "ok".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_engine_failure_fails_session() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![final_step("partial words", &[]), Step::Fail("decoder blew up".to_string())],
            FinalHypothesis::empty(),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();

        session.audio(audio()).await;
        let messages = session.audio(audio()).await;
        assert!(matches!(&messages[..], [ServerMessage::Error { message }] if message.contains("decoder blew up")));
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Failed));

        let record = store.get_session(session_id).await.unwrap();
        assert_eq!(record.session.status, SessionStatus::Failed);
        assert!(record.transcripts.is_empty());

        // The recognizer is gone: no flush, no further feeding
        assert!(session.audio(audio()).await.is_empty());
        assert!(matches!(session.stop().await, Err(SessionError::AlreadyClosed)));
        session.connection_lost().await;
        assert_eq!(engine.flushed.load(Ordering::SeqCst), 0);
        assert_eq!(engine.fed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_failure_fails_session() {
        let engine = Arc::new(ScriptedEngine::silent().failing_flush("flush exploded"));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine, store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();

        let messages = session.stop().await.unwrap();
        assert!(matches!(&messages[..], [ServerMessage::Error { .. }]));
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Failed));
        assert_eq!(
            store.get_session(session_id).await.unwrap().session.status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_connection_lost_finalizes_once() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![final_step("spoken before drop", &[Some(0.5), Some(0.5), Some(0.5)])],
            FinalHypothesis::empty(),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine.clone(), store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();
        session.audio(audio()).await;

        session.connection_lost().await;
        session.connection_lost().await;

        assert_eq!(engine.flushed.load(Ordering::SeqCst), 1);
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Completed));
        let record = store.get_session(session_id).await.unwrap();
        assert_eq!(record.session.status, SessionStatus::Completed);
        assert_eq!(record.transcripts[0].transcript_text, "spoken before drop");
        assert_eq!(record.transcripts[0].confidence, Some(0.5));
    }

    #[tokio::test]
    async fn test_connection_lost_before_start_writes_nothing() {
        let engine = Arc::new(ScriptedEngine::silent());
        let store = Arc::new(FaultyStore::new(Fault::None));
        let mut session = controller(engine, store.clone());
        session.connection_lost().await;
        assert_eq!(session.phase(), SessionPhase::Created);
        assert_eq!(store.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_result() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![final_step("keep me", &[])],
            FinalHypothesis::empty(),
        ));
        let store = Arc::new(FaultyStore::new(Fault::FailWrites));
        let mut session = controller(engine, store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();
        session.audio(audio()).await;

        let messages = session.stop().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], ServerMessage::Error { .. }));
        assert!(matches!(&messages[1], ServerMessage::Final { text, .. } if text == "keep me"));
        assert_eq!(
            session.phase(),
            SessionPhase::Closed(SessionOutcome::CompletedUnpersisted)
        );
        assert_eq!(
            store.get_session(session_id).await.unwrap().session.status,
            SessionStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_persistence_timeout_marks_failed() {
        let engine = Arc::new(ScriptedEngine::new(vec![final_step("slow", &[])], FinalHypothesis::empty()));
        let store = Arc::new(FaultyStore::new(Fault::Stall(Duration::from_secs(5))));
        let mut session = controller(engine, store);
        session.start(Metadata::new()).await.unwrap();
        session.audio(audio()).await;

        let begun = Instant::now();
        let messages = session.stop().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(matches!(messages.last(), Some(ServerMessage::Final { .. })));
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Failed));
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let store = Arc::new(FaultyStore::new(Fault::FailCreate));
        let mut session = controller(Arc::new(ScriptedEngine::silent()), store);
        assert!(matches!(
            session.start(Metadata::new()).await,
            Err(SessionError::Persistence(_))
        ));
        assert_eq!(session.phase(), SessionPhase::Created);

        let mut refused = controller(
            Arc::new(ScriptedEngine::silent().refusing()),
            Arc::new(MemorySessionStore::new()),
        );
        assert!(matches!(
            refused.start(Metadata::new()).await,
            Err(SessionError::Engine(_))
        ));
        assert_eq!(refused.phase(), SessionPhase::Created);
    }

    #[tokio::test]
    async fn test_client_metadata_kept() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(Arc::new(ScriptedEngine::silent()), store.clone());
        let mut metadata = Metadata::new();
        metadata.insert("title".to_string(), Value::String("standup".to_string()));
        session.start(metadata).await.unwrap();

        let record = store.get_session(session.session_id().unwrap()).await.unwrap();
        assert_eq!(record.session.metadata["title"], "standup");
        assert!(record.session.metadata["started_at"].is_string());
    }

    #[tokio::test]
    async fn test_chunk_confidence_carries_into_final() {
        let engine = Arc::new(ScriptedEngine::new(
            vec![Step::Final(FinalHypothesis {
                text: "hello world".to_string(),
                confidence: Some(0.85),
                words: Vec::new(),
            })],
            FinalHypothesis::empty(),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine, store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();

        assert_eq!(
            session.audio(audio()).await,
            vec![ServerMessage::FinalChunk {
                text: "hello world".to_string(),
                confidence: Some(0.85),
            }]
        );

        let messages = session.stop().await.unwrap();
        match &messages[..] {
            [ServerMessage::Final {
                text,
                word_count,
                confidence,
                ..
            }] => {
                assert_eq!(text, "hello world");
                assert_eq!(*word_count, 2);
                assert!((confidence.unwrap() - 0.85).abs() < 1e-6);
            }
            other => panic!("unexpected messages {:?}", other),
        }

        let record = store.get_session(session_id).await.unwrap();
        assert!((record.transcripts[0].confidence.unwrap() - 0.85).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_slow_flush_fails_lost_session() {
        let engine = Arc::new(
            ScriptedEngine::new(vec![final_step("said before", &[])], FinalHypothesis::empty())
                .slow_flush(Duration::from_millis(800)),
        );
        let store = Arc::new(MemorySessionStore::new());
        let mut session = controller(engine, store.clone());
        session.start(Metadata::new()).await.unwrap();
        let session_id = session.session_id().unwrap();
        session.audio(audio()).await;

        let begun = Instant::now();
        session.connection_lost().await;
        assert!(begun.elapsed() < Duration::from_millis(700));
        assert_eq!(session.phase(), SessionPhase::Closed(SessionOutcome::Failed));

        let record = store.get_session(session_id).await.unwrap();
        assert_eq!(record.session.status, SessionStatus::Failed);
        assert!(record.transcripts.is_empty());
    }
}

//! Test doubles for the recognition engine and the session store.

use crate::audio::PcmFrame;
use crate::error::{EngineError, PersistenceError};
use crate::storage::{
    MemorySessionStore, Metadata, SessionDetails, SessionId, SessionPage, SessionRecordStore, SessionUpdate,
    TranscriptId,
};
use crate::transcription::{FinalHypothesis, RecognitionEngine, RecognitionResult, Recognizer, WordResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted recognizer answers to the next frame.
#[derive(Debug, Clone)]
pub enum Step {
    Partial(String),
    Final(FinalHypothesis),
    Fail(String),
}

pub fn partial(text: &str) -> Step {
    Step::Partial(text.to_string())
}

pub fn final_step(text: &str, confidences: &[Option<f32>]) -> Step {
    Step::Final(hypothesis(text, confidences))
}

/// A hypothesis whose words are `text` split on whitespace, paired with
/// `confidences` in order.
pub fn hypothesis(text: &str, confidences: &[Option<f32>]) -> FinalHypothesis {
    FinalHypothesis {
        text: text.to_string(),
        confidence: None,
        words: text
            .split_whitespace()
            .zip(confidences)
            .map(|(w, &confidence)| WordResult {
                text: w.to_string(),
                confidence,
            })
            .collect(),
    }
}

/// Engine whose recognizers replay a fixed script, one step per frame.
pub struct ScriptedEngine {
    steps: Vec<Step>,
    flush: Result<FinalHypothesis, String>,
    refuse: bool,
    feed_delay: Duration,
    flush_delay: Duration,
    pub created: Arc<AtomicUsize>,
    pub fed: Arc<AtomicUsize>,
    pub flushed: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>, flush: FinalHypothesis) -> Self {
        Self {
            steps,
            flush: Ok(flush),
            refuse: false,
            feed_delay: Duration::ZERO,
            flush_delay: Duration::ZERO,
            created: Arc::new(AtomicUsize::new(0)),
            fed: Arc::new(AtomicUsize::new(0)),
            flushed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new(), FinalHypothesis::empty())
    }

    pub fn failing_flush(mut self, message: &str) -> Self {
        self.flush = Err(message.to_string());
        self
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Block each `feed` for `delay`, like a busy decoder.
    pub fn slow_feed(mut self, delay: Duration) -> Self {
        self.feed_delay = delay;
        self
    }

    pub fn slow_flush(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, EngineError> {
        if self.refuse {
            return Err(EngineError::UnsupportedSampleRate(sample_rate));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecognizer {
            steps: self.steps.iter().cloned().collect(),
            flush: self.flush.clone(),
            feed_delay: self.feed_delay,
            flush_delay: self.flush_delay,
            fed: Arc::clone(&self.fed),
            flushed: Arc::clone(&self.flushed),
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

struct ScriptedRecognizer {
    steps: VecDeque<Step>,
    flush: Result<FinalHypothesis, String>,
    feed_delay: Duration,
    flush_delay: Duration,
    fed: Arc<AtomicUsize>,
    flushed: Arc<AtomicUsize>,
}

impl Recognizer for ScriptedRecognizer {
    fn feed(&mut self, _frame: &PcmFrame) -> Result<RecognitionResult, EngineError> {
        std::thread::sleep(self.feed_delay);
        self.fed.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(Step::Partial(text)) => Ok(RecognitionResult::Partial { text }),
            Some(Step::Final(hypothesis)) => Ok(RecognitionResult::Final(hypothesis)),
            Some(Step::Fail(message)) => Err(EngineError::Inference(message)),
            None => Ok(RecognitionResult::Partial { text: String::new() }),
        }
    }

    fn flush(self: Box<Self>) -> Result<FinalHypothesis, EngineError> {
        std::thread::sleep(self.flush_delay);
        self.flushed.fetch_add(1, Ordering::SeqCst);
        self.flush.map_err(EngineError::Inference)
    }
}

/// How a [`FaultyStore`] misbehaves on terminal writes.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    None,
    /// `append_transcript` and `update_session` fail.
    FailWrites,
    /// `append_transcript` and `update_session` hang for this long first.
    Stall(Duration),
    /// `create_session` fails.
    FailCreate,
}

/// Memory store with injectable faults and call counters.
pub struct FaultyStore {
    pub inner: MemorySessionStore,
    fault: Fault,
    pub creates: AtomicUsize,
    pub appends: AtomicUsize,
    pub updates: AtomicUsize,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: MemorySessionStore::new(),
            fault,
            creates: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    async fn before_write(&self) -> Result<(), PersistenceError> {
        match self.fault {
            Fault::FailWrites => Err(PersistenceError::Database(sqlx::Error::PoolTimedOut)),
            Fault::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Fault::None | Fault::FailCreate => Ok(()),
        }
    }
}

#[async_trait]
impl SessionRecordStore for FaultyStore {
    async fn create_session(&self, metadata: Metadata) -> Result<SessionId, PersistenceError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Fault::FailCreate = self.fault {
            return Err(PersistenceError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.create_session(metadata).await
    }

    async fn append_transcript(
        &self,
        session_id: SessionId,
        text: &str,
        confidence: Option<f32>,
    ) -> Result<TranscriptId, PersistenceError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.before_write().await?;
        self.inner.append_transcript(session_id, text, confidence).await
    }

    async fn update_session(&self, session_id: SessionId, update: SessionUpdate) -> Result<(), PersistenceError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.before_write().await?;
        self.inner.update_session(session_id, update).await
    }

    async fn list_sessions(&self, skip: u64, limit: u64) -> Result<SessionPage, PersistenceError> {
        self.inner.list_sessions(skip, limit).await
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionDetails, PersistenceError> {
        self.inner.get_session(session_id).await
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        self.inner.delete_session(session_id).await
    }

    fn backend(&self) -> &'static str {
        "faulty"
    }
}

/// Base64 for `samples` 16-bit little-endian samples of a loud tone.
pub fn speech(samples: usize) -> String {
    use base64::Engine as _;
    let bytes: Vec<u8> = (0..samples)
        .flat_map(|i| (((i % 32) as i16 - 16) * 1000).to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

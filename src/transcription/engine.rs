//! # Recognition Engine Seam
//!
//! The session controller talks to speech recognition only through these
//! two traits:
//!
//! - [`RecognitionEngine`]: process-wide and read-only. It owns the loaded
//!   model and hands out one recognizer per session.
//! - [`Recognizer`]: per-session streaming state. It is fed frames one at a
//!   time and flushed exactly once at the end. `flush` takes the boxed
//!   recognizer by value, so a flushed recognizer cannot be fed again.

use crate::audio::PcmFrame;
use crate::error::EngineError;
use serde::Serialize;

pub trait RecognitionEngine: Send + Sync {
    /// Create a fresh recognizer for audio at `sample_rate`.
    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, EngineError>;

    /// Human-readable engine description for health output.
    fn describe(&self) -> String;
}

pub trait Recognizer: Send {
    /// Process one frame. Blocking; callers run it off the async executor.
    fn feed(&mut self, frame: &PcmFrame) -> Result<RecognitionResult, EngineError>;

    /// Finish the stream and return whatever speech is still pending.
    fn flush(self: Box<Self>) -> Result<FinalHypothesis, EngineError>;
}

/// Outcome of feeding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    /// The current, still-changing guess for the utterance in progress.
    Partial { text: String },
    /// An utterance boundary was reached and this text is settled.
    Final(FinalHypothesis),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FinalHypothesis {
    pub text: String,
    /// Engine-level confidence for the whole chunk, when it has one.
    pub confidence: Option<f32>,
    pub words: Vec<WordResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordResult {
    pub text: String,
    pub confidence: Option<f32>,
}

impl FinalHypothesis {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Confidence to report for this chunk: the engine's own figure, or
    /// the mean of the word confidences that were supplied.
    pub fn chunk_confidence(&self) -> Option<f32> {
        self.confidence.or_else(|| {
            let scores: Vec<f32> = self.words.iter().filter_map(|w| w.confidence).collect();
            if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f32>() / scores.len() as f32)
            }
        })
    }
}

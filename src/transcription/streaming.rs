//! # Streaming Recognition over Whisper
//!
//! Whisper transcribes whole clips, so streaming is built on top of it:
//! an [`UtteranceSegmenter`] watches the audio level, buffers speech, and
//! decides when an utterance is over. The recognizer re-decodes the growing
//! utterance now and then for `partial` results and decodes it one last
//! time at the boundary for the settled `final_chunk`.

use super::engine::{FinalHypothesis, RecognitionEngine, RecognitionResult, Recognizer};
use super::model::{Decoded, WhisperModel};
use crate::audio::PcmFrame;
use crate::config::StreamingConfig;
use crate::device;
use crate::error::EngineError;
use candle_transformers::models::whisper as m;
use std::sync::Arc;
use tracing::debug;

/// What the segmenter wants done after a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// Nothing buffered; no speech heard yet.
    Idle,
    /// Speech in progress. `refresh` asks for a new partial decode.
    Speaking { refresh: bool },
    /// The utterance ended; these are its samples.
    Boundary(Vec<f32>),
}

/// Cuts a sample stream into utterances at pauses.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    pause_samples: usize,
    partial_samples: usize,
    max_samples: usize,
    buffer: Vec<f32>,
    heard_speech: bool,
    trailing_silence: usize,
    since_refresh: usize,
}

impl UtteranceSegmenter {
    pub fn new(settings: &StreamingConfig, sample_rate: u32) -> Self {
        let per_ms = sample_rate as usize / 1000;
        Self {
            pause_samples: settings.pause_ms as usize * per_ms,
            partial_samples: settings.partial_interval_ms as usize * per_ms,
            max_samples: settings.max_utterance_secs as usize * sample_rate as usize,
            buffer: Vec::new(),
            heard_speech: false,
            trailing_silence: 0,
            since_refresh: 0,
        }
    }

    pub fn push(&mut self, samples: &[f32], silent: bool) -> SegmentEvent {
        if !self.heard_speech && silent {
            return SegmentEvent::Idle;
        }

        self.buffer.extend_from_slice(samples);
        self.since_refresh += samples.len();
        if silent {
            self.trailing_silence += samples.len();
        } else {
            self.heard_speech = true;
            self.trailing_silence = 0;
        }

        if self.trailing_silence >= self.pause_samples || self.buffer.len() >= self.max_samples {
            return SegmentEvent::Boundary(self.take());
        }

        if self.since_refresh >= self.partial_samples {
            self.since_refresh = 0;
            SegmentEvent::Speaking { refresh: true }
        } else {
            SegmentEvent::Speaking { refresh: false }
        }
    }

    /// Audio of the utterance in progress.
    pub fn pending(&self) -> &[f32] {
        &self.buffer
    }

    /// Drain the utterance in progress, if any speech was heard.
    pub fn finish(&mut self) -> Option<Vec<f32>> {
        if self.heard_speech {
            Some(self.take())
        } else {
            None
        }
    }

    fn take(&mut self) -> Vec<f32> {
        self.heard_speech = false;
        self.trailing_silence = 0;
        self.since_refresh = 0;
        std::mem::take(&mut self.buffer)
    }
}

/// Engine backed by a shared Whisper model.
pub struct WhisperEngine {
    model: Arc<WhisperModel>,
    streaming: StreamingConfig,
}

impl WhisperEngine {
    pub fn new(model: Arc<WhisperModel>, streaming: StreamingConfig) -> Self {
        Self { model, streaming }
    }
}

impl RecognitionEngine for WhisperEngine {
    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>, EngineError> {
        if sample_rate as usize != m::SAMPLE_RATE {
            return Err(EngineError::UnsupportedSampleRate(sample_rate));
        }
        Ok(Box::new(WhisperRecognizer {
            network: self.model.instance(),
            model: Arc::clone(&self.model),
            segmenter: UtteranceSegmenter::new(&self.streaming, sample_rate),
            silence_threshold: self.streaming.silence_threshold,
            partial: String::new(),
        }))
    }

    fn describe(&self) -> String {
        format!(
            "whisper-{} ({})",
            self.model.size(),
            device::describe(self.model.device())
        )
    }
}

pub struct WhisperRecognizer {
    model: Arc<WhisperModel>,
    network: m::model::Whisper,
    segmenter: UtteranceSegmenter,
    silence_threshold: f32,
    partial: String,
}

impl WhisperRecognizer {
    fn decode(&mut self, samples: &[f32]) -> Result<Decoded, EngineError> {
        let decoded = self.model.transcribe(&mut self.network, samples)?;
        debug!(
            seconds = samples.len() as f64 / m::SAMPLE_RATE as f64,
            text = %decoded.text,
            "Decoded utterance"
        );
        Ok(decoded)
    }
}

impl From<Decoded> for FinalHypothesis {
    fn from(decoded: Decoded) -> Self {
        FinalHypothesis {
            text: decoded.text,
            confidence: None,
            words: decoded.words,
        }
    }
}

impl Recognizer for WhisperRecognizer {
    fn feed(&mut self, frame: &PcmFrame) -> Result<RecognitionResult, EngineError> {
        let silent = frame.is_silent(self.silence_threshold);
        match self.segmenter.push(&frame.to_f32(), silent) {
            SegmentEvent::Idle => Ok(RecognitionResult::Partial { text: String::new() }),
            SegmentEvent::Speaking { refresh: false } => Ok(RecognitionResult::Partial {
                text: self.partial.clone(),
            }),
            SegmentEvent::Speaking { refresh: true } => {
                let pending = self.segmenter.pending().to_vec();
                self.partial = self.decode(&pending)?.text;
                Ok(RecognitionResult::Partial {
                    text: self.partial.clone(),
                })
            }
            SegmentEvent::Boundary(utterance) => {
                self.partial.clear();
                Ok(RecognitionResult::Final(self.decode(&utterance)?.into()))
            }
        }
    }

    fn flush(mut self: Box<Self>) -> Result<FinalHypothesis, EngineError> {
        match self.segmenter.finish() {
            Some(utterance) => Ok(self.decode(&utterance)?.into()),
            None => Ok(FinalHypothesis::empty()),
        }
    }
}

use crate::protocol::ServerMessage;
use crate::transcription::FinalHypothesis;
use std::time::Duration;

/// Settled text of one session, in the order it was recognized.
///
/// Only non-empty trimmed chunks are kept, so joining them with single
/// spaces reproduces exactly what the client saw in `final_chunk` messages.
/// Word confidences are tallied as they arrive; words without one are left
/// out of the average instead of counting as zero. A chunk with no word
/// confidences but a chunk-level one counts that value once per word.
#[derive(Debug, Default)]
pub struct AccumulatedTranscript {
    chunks: Vec<String>,
    confidence_sum: f64,
    confidence_count: usize,
}

/// Figures written when a session ends and echoed in the `final` message.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSummary {
    pub text: String,
    pub word_count: u32,
    pub duration_seconds: f64,
    pub confidence: Option<f32>,
}

impl AccumulatedTranscript {
    /// Add a settled hypothesis. Returns the trimmed text when it was kept.
    pub fn record(&mut self, hypothesis: &FinalHypothesis) -> Option<String> {
        let text = hypothesis.text.trim();

        let mut scored = false;
        for confidence in hypothesis.words.iter().filter_map(|w| w.confidence) {
            self.confidence_sum += confidence as f64;
            self.confidence_count += 1;
            scored = true;
        }
        if let (false, Some(confidence)) = (scored, hypothesis.confidence) {
            let words = text.split_whitespace().count();
            self.confidence_sum += confidence as f64 * words as f64;
            self.confidence_count += words;
        }

        if text.is_empty() {
            return None;
        }
        self.chunks.push(text.to_string());
        Some(text.to_string())
    }

    pub fn text(&self) -> String {
        self.chunks.join(" ").trim().to_string()
    }

    pub fn mean_confidence(&self) -> Option<f32> {
        if self.confidence_count == 0 {
            None
        } else {
            Some((self.confidence_sum / self.confidence_count as f64) as f32)
        }
    }

    pub fn summarize(&self, elapsed: Duration) -> TranscriptSummary {
        let text = self.text();
        TranscriptSummary {
            word_count: text.split_whitespace().count() as u32,
            text,
            duration_seconds: elapsed.as_secs_f64(),
            confidence: self.mean_confidence(),
        }
    }
}

impl TranscriptSummary {
    pub fn rounded_duration(&self) -> f64 {
        (self.duration_seconds * 100.0).round() / 100.0
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Final {
            text: self.text.clone(),
            word_count: self.word_count as usize,
            duration: self.rounded_duration(),
            confidence: self.confidence,
        }
    }
}

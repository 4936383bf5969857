//! # Speech Recognition
//!
//! Speech-to-text with Whisper models via the Candle-rs framework, behind
//! the [`RecognitionEngine`] / [`Recognizer`] seam the session controller
//! depends on.
//!
//! ## Key Components:
//! - **engine**: the traits and result types every engine speaks
//! - **model**: loading a Whisper checkpoint and decoding one utterance
//! - **streaming**: utterance segmentation that turns Whisper into a
//!   streaming recognizer
//! - **mel**: the mel filter bank for the spectrogram front end
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, the default, good for live captions on a CPU
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, handles technical vocabulary
//! - **large**: ~1550MB, best accuracy, wants a GPU for real time

pub mod engine;
pub mod mel;
pub mod model;
pub mod streaming;

pub use engine::{FinalHypothesis, RecognitionEngine, RecognitionResult, Recognizer, WordResult};
pub use model::WhisperModel;
pub use streaming::WhisperEngine;

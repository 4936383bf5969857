//! Per-connection transcription sessions.

pub mod controller;
pub mod transcript;

pub use controller::{SessionOutcome, SessionPhase, SessionSettings, TranscriptionSessionController};

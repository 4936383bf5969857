//! # Audio Ingestion
//!
//! Turns transport payloads into PCM frames the recognizer can consume.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (`audio.sample_rate`)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono by default (`audio.channels`)
//! - **Encoding**: Little-endian signed integers, base64 in JSON `audio`
//!   messages or raw in binary WebSocket frames

pub mod processor;

pub use processor::{AudioFrameProcessor, AudioPayload, PcmFrame};

//! # Audio Frame Decoding and Validation
//!
//! Every `audio` message (or binary WebSocket frame) passes through
//! [`AudioFrameProcessor`] before it reaches the recognizer:
//!
//! 1. **Decode**: base64 text or raw bytes become signed 16-bit little-endian samples
//! 2. **Validate**: empty frames and format mismatches are rejected; very short
//!    frames are logged but accepted
//! 3. **Measure**: duration, RMS level and silence detection for the segmenter

use crate::error::DecodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

/// Audio as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    /// The `data` field of a JSON `audio` message.
    Base64(String),
    /// A binary WebSocket frame.
    Pcm(Vec<u8>),
}

/// A decoded chunk of interleaved 16-bit samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Size of the frame on the wire.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    /// Scale samples from `[-32768, 32767]` to `[-1.0, 1.0)`.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    /// Root mean square level, normalized to `[0.0, 1.0]`.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        (sum_squares / self.samples.len() as f64).sqrt() as f32
    }

    pub fn is_silent(&self, threshold: f32) -> bool {
        self.rms() < threshold
    }
}

/// Decodes and validates audio for one session's negotiated format.
#[derive(Debug, Clone)]
pub struct AudioFrameProcessor {
    sample_rate: u32,
    channels: u16,
}

impl AudioFrameProcessor {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Decode a transport payload into a PCM frame in the session's format.
    ///
    /// ## Errors:
    /// - `DecodeError::Base64` when the text is not valid base64
    /// - `DecodeError::Empty` when there are no bytes at all
    /// - `DecodeError::OddLength` when the bytes cannot be split into 16-bit samples
    pub fn decode(&self, payload: &AudioPayload) -> Result<PcmFrame, DecodeError> {
        let decoded;
        let bytes: &[u8] = match payload {
            AudioPayload::Base64(text) => {
                decoded = STANDARD.decode(text.trim())?;
                &decoded
            }
            AudioPayload::Pcm(bytes) => bytes,
        };

        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::OddLength(bytes.len()));
        }

        let mut samples = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut samples);

        Ok(PcmFrame::new(samples, self.sample_rate, self.channels))
    }

    /// Check a frame against the expected format.
    ///
    /// Empty frames and rate or channel mismatches are rejected. Frames
    /// shorter than 100 ms are suspicious but legal: clients may flush a
    /// short tail, so they only produce a warning.
    pub fn validate(&self, frame: &PcmFrame, expected_sample_rate: u32, expected_channels: u16) -> bool {
        if frame.is_empty() {
            return false;
        }

        if frame.sample_rate != expected_sample_rate || frame.channels != expected_channels {
            warn!(
                sample_rate = frame.sample_rate,
                channels = frame.channels,
                expected_sample_rate,
                expected_channels,
                "Audio frame format does not match the session"
            );
            return false;
        }

        let min_bytes = Self::min_frame_bytes(expected_sample_rate, expected_channels);
        if frame.byte_len() < min_bytes {
            warn!(
                bytes = frame.byte_len(),
                min_bytes,
                "Audio frame shorter than 100ms"
            );
        }

        true
    }

    /// Bytes in 100 ms of 16-bit audio.
    pub fn min_frame_bytes(sample_rate: u32, channels: u16) -> usize {
        sample_rate as usize * channels as usize * 2 / 10
    }
}

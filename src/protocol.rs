//! # Transcription Wire Protocol
//!
//! JSON text frames tagged by `type`.
//!
//! ## Client → Server:
//! - `{"type": "start", "metadata": {...}}`: begin a session (metadata optional)
//! - `{"type": "audio", "data": "<base64 PCM>"}`: one chunk of audio
//! - `{"type": "stop"}`: finish the session and get the final transcript
//!
//! Binary frames are raw PCM and count as `audio`.
//!
//! ## Server → Client:
//! - `session_started`, `partial`, `final_chunk`, `final`, `error`

use crate::audio::AudioPayload;
use crate::error::ProtocolError;
use crate::storage::{Metadata, SessionId};
use serde::Serialize;
use serde_json::Value;

/// A parsed client control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Start { metadata: Metadata },
    Audio { payload: AudioPayload },
    Stop,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. } => "start",
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Stop => "stop",
        }
    }
}

/// Parse one JSON text frame.
///
/// Unknown `type` values are reported separately from malformed JSON so the
/// client gets `Unknown message type: <type>` back.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match kind {
        "start" => {
            let metadata = match value.get("metadata") {
                None | Some(Value::Null) => Metadata::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(ProtocolError::Malformed(
                        "start metadata must be a JSON object".to_string(),
                    ))
                }
            };
            Ok(ClientMessage::Start { metadata })
        }
        "audio" => {
            let data = value
                .get("data")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField {
                    kind: "audio",
                    field: "data",
                })?;
            Ok(ClientMessage::Audio {
                payload: AudioPayload::Base64(data.to_string()),
            })
        }
        "stop" => Ok(ClientMessage::Stop),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Messages the server sends back over the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: SessionId,
    },
    Partial {
        text: String,
    },
    FinalChunk {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    Final {
        text: String,
        word_count: usize,
        /// Seconds, rounded to two decimals.
        duration: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl ToString) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionStarted { .. } => "session_started",
            ServerMessage::Partial { .. } => "partial",
            ServerMessage::FinalChunk { .. } => "final_chunk",
            ServerMessage::Final { .. } => "final",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings, numbers and a UUID: serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode response: {}"}}"#, e)
        })
    }
}

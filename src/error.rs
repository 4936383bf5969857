//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`DecodeError`, `ProtocolError`, `EngineError`,
//!   `PersistenceError`, `ModelLoadError`, `SessionError`): typed failures of
//!   the transcription pipeline. Each one tells the session controller what
//!   to do next: a decode or protocol error is reported and the session goes
//!   on, an engine error fails the session, a persistence error leaves a
//!   consistency gap that is logged, a model load error stops the process.
//! - **HTTP errors** (`AppError`): what the REST handlers return, converted
//!   into JSON responses through actix's `ResponseError`.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "Session 1b4e28ba-2fa1-11d2-883f-0016d3cca427 not found",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::storage::{SessionId, SessionStatus};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// A transport payload could not be turned into PCM samples.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 audio data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("audio payload is empty")]
    Empty,

    #[error("audio payload of {0} bytes is not a whole number of 16-bit samples")]
    OddLength(usize),
}

/// A client control message was malformed or of an unknown kind.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no type")]
    MissingType,

    #[error("Message of type '{kind}' is missing field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// The recognition engine failed to create a recognizer or to process audio.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("recognizer does not support {0} Hz audio")]
    UnsupportedSampleRate(u32),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("recognizer task failed: {0}")]
    Task(String),

    #[error("recognizer is no longer available")]
    RecognizerLost,

    #[error("recognizer did not finish within {0} ms")]
    FlushTimeout(u128),
}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        EngineError::Inference(err.to_string())
    }
}

/// The session record store rejected or failed an operation.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("refusing to store an empty transcript")]
    EmptyTranscript,

    #[error("session {0} already has a transcript")]
    TranscriptExists(SessionId),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("storage did not respond within {0} ms")]
    Timeout(u128),
}

/// The recognition model could not be fetched or loaded at startup.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("unknown model size '{0}'")]
    UnknownModel(String),

    #[error("failed to fetch '{file}' from {repo}: {message}")]
    Download {
        repo: String,
        file: String,
        message: String,
    },

    #[error("model file {0} does not exist")]
    MissingFile(String),

    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid model config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),

    #[error("tokenizer has no token '{0}'")]
    MissingToken(String),

    #[error("failed to load model weights: {0}")]
    Weights(#[from] candle_core::Error),
}

/// A session operation was not valid in the controller's current state, or
/// one of its collaborators failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("No active session. Send a start message first")]
    NotStarted,

    #[error("Session already closed")]
    AlreadyClosed,

    #[error("Could not start recognizer: {0}")]
    Engine(#[from] EngineError),

    #[error("Could not record session: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors returned by the REST handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **Unavailable**: Server is at capacity (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Missing sessions become 404s; everything else the store reports is the
/// server's problem.
impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound(id) => AppError::NotFound(format!("Session {} not found", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

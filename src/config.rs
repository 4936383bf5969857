//! # Configuration Management
//!
//! Settings are layered from several sources, highest priority first:
//! 1. Deployment variables `HOST`, `PORT` and `DATABASE_URL`
//! 2. Environment variables with the `APP_` prefix, nested with `__`
//!    (`APP_SESSION__QUEUE_SIZE=200` sets `session.queue_size`)
//! 3. The optional `config.toml` file next to the binary
//! 4. The defaults in [`AppConfig::default`]
//!
//! ## Sections:
//! - **server**: bind address and allowed CORS origins
//! - **models**: which Whisper checkpoint to load and on which device
//! - **audio**: the PCM format clients must stream
//! - **streaming**: how the recognizer cuts the stream into utterances
//! - **session**: per-connection queue depth, heartbeat and persistence budget
//! - **database**: where session records are kept
//! - **performance**: global capacity limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub streaming: StreamingConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub performance: PerformanceConfig,
}

/// Server bind address.
///
/// `host = "0.0.0.0"` accepts connections from any interface; the default
/// only listens on localhost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. `"*"` allows any origin.
    pub cors_origins: Vec<String>,
}

/// Recognition model settings.
///
/// ## Fields:
/// - `whisper_model`: checkpoint size ("tiny", "base", "small", "medium", "large")
/// - `model_dir`: local directory with `config.json`, `tokenizer.json` and
///   `model.safetensors`; when unset the files are fetched from the Hugging Face hub
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `language`: language token to force, e.g. "en"; unset lets the model decide
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    #[serde(default)]
    pub model_dir: Option<String>,
    pub device: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// The PCM format clients stream: signed 16-bit little-endian samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Utterance segmentation for the streaming recognizer.
///
/// A pause of `pause_ms` after speech closes the current utterance and
/// produces a `final_chunk`. Utterances are also cut at `max_utterance_secs`
/// because the model only sees 30 seconds at a time. While speech continues
/// the pending audio is re-decoded every `partial_interval_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub pause_ms: u64,
    pub partial_interval_ms: u64,
    pub max_utterance_secs: u64,
    /// Normalized RMS level below which a frame counts as silence.
    pub silence_threshold: f32,
}

/// Per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inbound messages buffered per connection before backpressure kicks in.
    pub queue_size: usize,
    /// Upper bound on each round of session-record writes.
    pub finalize_timeout_ms: u64,
    /// Upper bound on the recognizer's closing decode.
    pub flush_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Session record storage.
///
/// `url` is a sqlx SQLite URL (`sqlite://transcriptions.db`) or `memory` for
/// a non-durable in-process store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of open transcription connections.
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
            },
            models: ModelsConfig {
                whisper_model: "base".to_string(),
                model_dir: None,
                device: "auto".to_string(),
                language: Some("en".to_string()),
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
            },
            streaming: StreamingConfig {
                pause_ms: 700,
                partial_interval_ms: 1000,
                max_utterance_secs: 25,
                silence_threshold: 0.01,
            },
            session: SessionConfig {
                queue_size: 100,
                finalize_timeout_ms: 5000,
                flush_timeout_ms: 15000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            database: DatabaseConfig {
                url: "sqlite://transcriptions.db".to_string(),
                max_connections: 5,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Field names contain underscores, so nesting uses a double one
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(url) = env::var("DATABASE_URL") {
            settings = settings.set_override("database.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be greater than 0"));
        }

        if !(self.streaming.silence_threshold > 0.0 && self.streaming.silence_threshold < 1.0) {
            return Err(anyhow::anyhow!("Silence threshold must be between 0 and 1"));
        }

        if self.streaming.pause_ms == 0 || self.streaming.partial_interval_ms == 0 {
            return Err(anyhow::anyhow!("Pause and partial intervals must be greater than 0"));
        }

        if self.streaming.max_utterance_secs == 0 || self.streaming.max_utterance_secs > 30 {
            return Err(anyhow::anyhow!("Max utterance length must be between 1 and 30 seconds"));
        }

        if self.session.queue_size == 0 {
            return Err(anyhow::anyhow!("Session queue size must be greater than 0"));
        }

        if self.session.finalize_timeout_ms == 0 || self.session.flush_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Finalize and flush timeouts must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0
            || self.session.client_timeout_secs <= self.session.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("Database pool needs at least one connection"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}

impl SessionConfig {
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Longest a session can take to finish once its connection is gone:
    /// the closing decode plus one round of record writes.
    pub fn drain_timeout(&self) -> Duration {
        self.flush_timeout() + self.finalize_timeout()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

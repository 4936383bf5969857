//! # Live Transcribe Backend - Main Application Entry Point
//!
//! Real-time speech transcription over WebSocket.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, `config.toml`, environment)
//! - **audio**: Decoding and validating client PCM frames
//! - **transcription**: The recognition engine seam and its Whisper implementation
//! - **session**: The per-connection session state machine
//! - **storage**: Session and transcript records (SQLite or in-memory)
//! - **websocket**: The `/ws/transcribe` actor and its session worker
//! - **handlers**, **health**: REST endpoints
//! - **middleware**: Request metrics
//!
//! The Whisper model is loaded once, before the server binds. A model that
//! cannot be loaded stops the process.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod session;
mod state;
mod storage;
#[cfg(test)]
mod testing;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use device::DevicePreference;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{RecognitionEngine, WhisperEngine, WhisperModel};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-transcribe-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let device = config.models.device.parse::<DevicePreference>()?.select();
    info!(
        "Loading Whisper model '{}' on {}",
        config.models.whisper_model,
        device::describe(&device)
    );
    let model = WhisperModel::load(&config.models, device)
        .await
        .context("failed to load the speech recognition model")?;
    let engine: Arc<dyn RecognitionEngine> =
        Arc::new(WhisperEngine::new(Arc::new(model), config.streaming.clone()));
    info!("Recognition engine ready: {}", engine.describe());

    let store = storage::open_store(&config.database)
        .await
        .context("failed to open the session store")?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, engine, store);
    let workers = Arc::clone(&app_state.workers);
    let drain_timeout = app_state.config.session.drain_timeout();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors(&app_state.config.server.cors_origins))
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(health::root))
            .route("/health", web::get().to(health::health_check))
            .route("/ws/transcribe", web::get().to(websocket::transcribe_socket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::delete_session)),
            )
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Closed connections leave their sessions finalizing on this runtime.
    if !workers.wait_idle(drain_timeout).await {
        warn!(
            running = workers.running(),
            "Sessions still finalizing at shutdown; their records may stay in_progress"
        );
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console, filtered by `RUST_LOG`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_transcribe_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Browser origins from `server.cors_origins`; `*` allows any origin.
fn cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

    if origins.iter().any(|origin| origin == "*") {
        return cors.allow_any_origin();
    }

    origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: loaded once at startup, read-only afterwards
//! - **engine**: the recognition engine, initialized before the server binds
//! - **store**: session record storage
//! - **metrics**: request counters, per-endpoint timings and connection counts
//! - **workers**: the session worker tasks still running, so shutdown can
//!   wait for them to finalize
//!
//! Counters are atomics so the hot path (every request, every connection)
//! never waits on a lock; only the per-endpoint map sits behind a `Mutex`.

use crate::config::AppConfig;
use crate::session::{SessionOutcome, SessionPhase, SessionSettings};
use crate::storage::SessionRecordStore;
use crate::transcription::RecognitionEngine;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<dyn RecognitionEngine>,
    pub store: Arc<dyn SessionRecordStore>,
    pub metrics: Arc<AppMetrics>,
    pub workers: Arc<SessionWorkers>,
    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all requests and connections.
#[derive(Debug, Default)]
pub struct AppMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    open_connections: AtomicUsize,
    sessions_completed: AtomicU64,
    sessions_unpersisted: AtomicU64,
    sessions_failed: AtomicU64,
    endpoints: Mutex<HashMap<String, EndpointMetric>>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

/// Point-in-time copy of [`AppMetrics`] for the health and metrics endpoints.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub open_connections: usize,
    pub sessions_completed: u64,
    pub sessions_unpersisted: u64,
    pub sessions_failed: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// One admitted WebSocket connection. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    metrics: Arc<AppMetrics>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.metrics.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tracks session worker tasks.
///
/// Workers run on the runtime that built the state (the main runtime in
/// production), not on the HTTP worker threads, so they keep running after
/// the server stops and its worker runtimes are torn down.
#[derive(Debug)]
pub struct SessionWorkers {
    runtime: Option<Handle>,
    running: AtomicUsize,
    idle: Notify,
}

/// Held by a running worker task; dropped when it ends, panics or is cancelled.
struct RunningWorker(Arc<SessionWorkers>);

impl Drop for RunningWorker {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl SessionWorkers {
    pub fn new() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            running: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningWorker(Arc::clone(self));
        let task = async move {
            let _guard = guard;
            task.await;
        };
        match &self.runtime {
            Some(runtime) => drop(runtime.spawn(task)),
            None => drop(tokio::spawn(task)),
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until no worker is running. Returns `false` if `limit` ran out first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.idle.notified();
                if self.running() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

impl Default for SessionWorkers {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn RecognitionEngine>,
        store: Arc<dyn SessionRecordStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            store,
            metrics: Arc::new(AppMetrics::default()),
            workers: Arc::new(SessionWorkers::new()),
            start_time: Instant::now(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from_config(&self.config)
    }

    /// Claim a connection slot, or `None` when `max_concurrent_sessions`
    /// connections are already open.
    pub fn try_open_connection(&self) -> Option<ConnectionSlot> {
        let limit = self.config.performance.max_concurrent_sessions;
        self.metrics
            .open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < limit).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                metrics: Arc::clone(&self.metrics),
            })
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record timing for an endpoint such as `"GET /api/v1/sessions"`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut endpoints = self.endpoints();
        let metric = endpoints.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    /// Count how a finished session ended. Sessions that never started are
    /// not counted.
    pub fn record_session(&self, phase: SessionPhase) {
        let counter = match phase {
            SessionPhase::Closed(SessionOutcome::Completed) => &self.sessions_completed,
            SessionPhase::Closed(SessionOutcome::CompletedUnpersisted) => &self.sessions_unpersisted,
            SessionPhase::Closed(SessionOutcome::Failed) => &self.sessions_failed,
            SessionPhase::Created | SessionPhase::Active | SessionPhase::Finalizing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            open_connections: self.open_connections(),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_unpersisted: self.sessions_unpersisted.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            endpoint_metrics: self.endpoints().clone(),
        }
    }

    // A panic while holding the lock leaves the counters usable.
    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, EndpointMetric>> {
        self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Share of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **Configuration**: Loaded once at startup, read-only afterwards
//! - **Session registry**: The active language and the pooled recognition sessions.
//!   Handlers reach it only through `select` / `acquire` / `release`
//! - **Audio pipeline**: Stateless per-frame processing settings (gain, noise window)
//! - **Recording store**: Present only when `debug.audio_debug` is on
//! - **Metrics**: Request counters, per-endpoint latency and recognition outcomes
//!
//! ## Arc<RwLock<T>> Pattern:
//! Metrics are written by every request and read by `/metrics`, so they sit
//! behind a reader-writer lock. Everything else is immutable after startup and
//! is shared with a plain `Arc`.

use crate::audio::pipeline::AudioPipeline;
use crate::audio::processor::AudioProcessor;
use crate::config::AppConfig;
use crate::protocol::ProtocolOutcome;
use crate::recordings::RecordingStore;
use crate::transcription::registry::LanguageSessionManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (immutable after startup)
    pub config: Arc<AppConfig>,

    /// Active language and recognition session pool
    pub sessions: Arc<LanguageSessionManager>,

    /// Frame-to-recognizer processing settings
    pub pipeline: AudioPipeline,

    /// Debug capture of request audio, if enabled
    pub recordings: Option<RecordingStore>,

    /// Performance metrics (updated by every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Detailed metrics per endpoint, keyed like `"POST /NmspServlet/"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// How recognition requests ended
    pub recognition: RecognitionMetrics,
}

/// Detailed performance metrics for a specific endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Outcome counters for `/NmspServlet/` requests that reached the pipeline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecognitionMetrics {
    pub success: u64,
    pub no_speech: u64,
    pub decode_error: u64,
    /// Frames fed to recognizers, after trimming
    pub frames_processed: u64,
}

impl AppState {
    /// Assemble the shared state from already-built components.
    ///
    /// The pipeline settings come straight from `config.audio`; the config has
    /// been validated at this point, so the noise window policy parses.
    pub fn new(
        config: AppConfig,
        sessions: Arc<LanguageSessionManager>,
        recordings: Option<RecordingStore>,
    ) -> anyhow::Result<Self> {
        let pipeline = AudioPipeline::new(
            AudioProcessor::new(config.audio.gain),
            config.noise_window_policy()?,
        );

        Ok(Self {
            config: Arc::new(config),
            sessions,
            pipeline,
            recordings,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        })
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: Method and path, e.g. `"GET /heartbeat"`
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether the response was a 4xx or 5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Count how a recognition request ended.
    pub fn record_outcome(&self, outcome: &ProtocolOutcome, frames: usize) {
        let mut metrics = self.metrics_write();
        let recognition = &mut metrics.recognition;

        match outcome {
            ProtocolOutcome::Success(_) => recognition.success += 1,
            ProtocolOutcome::NoSpeechDetected => recognition.no_speech += 1,
            ProtocolOutcome::DecodeError => recognition.decode_error += 1,
        }
        recognition.frames_processed += frames as u64;
    }

    /// Consistent copy of the current metrics for the `/metrics` endpoint.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

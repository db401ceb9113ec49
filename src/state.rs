//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler and WebSocket
//! actor. Configuration and metrics sit behind `Arc<RwLock<_>>` so many
//! requests can read while occasional writers update.
//!
//! The orchestration core's singletons also live here and are constructed
//! exactly once per process: the rate-limit bucket store is shared and
//! keyed by client, the playback queue maps to the one physical audio
//! output, and the scheduler's timer table is shared but keyed per
//! session. No ambient globals — everything is injected from this struct.

use crate::analysis::{FallbackAnalyzer, ReasoningBackend};
use crate::audio::{AudioPlaybackQueue, AudioSink};
use crate::config::AppConfig;
use crate::limiter::RateLimiter;
use crate::scheduler::AnalysisScheduler;
use crate::session::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (updatable at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request/error counters and per-endpoint stats
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Sliding-window admission control, keyed by client address
    pub limiter: Arc<RateLimiter>,

    /// Per-session debounce timer table
    pub scheduler: Arc<AnalysisScheduler>,

    /// Process-wide spoken-feedback queue
    pub audio_queue: Arc<AudioPlaybackQueue>,

    /// Live sessions by id
    pub sessions: Arc<SessionRegistry>,

    /// External reasoning collaborator
    pub backend: Arc<dyn ReasoningBackend>,

    /// Local recovery path when the backend fails
    pub fallback: Arc<FallbackAnalyzer>,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Detailed metrics per endpoint, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint counters.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the shared state, constructing the core singletons from
    /// configuration. The backend and audio sink come in as trait objects
    /// so tests can substitute doubles.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn ReasoningBackend>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(config.limits.window_ms),
            config.limits.max_requests,
            config.limits.max_keys,
            Duration::from_secs(config.limits.idle_ttl_secs),
        ));
        let audio_queue = Arc::new(AudioPlaybackQueue::new(config.audio.queue_capacity, sink));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            limiter,
            scheduler: Arc::new(AnalysisScheduler::new()),
            audio_queue,
            sessions: Arc::new(SessionRegistry::new()),
            backend,
            fallback: Arc::new(FallbackAnalyzer::new()),
        }
    }

    /// Get a copy of the current configuration. Cloning releases the read
    /// lock immediately; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validation.
    ///
    /// Note: the limiter and queue were sized from the config at startup;
    /// limit changes apply to new checks, structural changes (capacities)
    /// take effect on restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one finished request for an endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot metrics for the health endpoints without holding the lock
    /// during response serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

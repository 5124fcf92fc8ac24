//! # Application State Management
//!
//! Shared state handed to every HTTP handler and voice connection: the
//! runtime configuration, the immutable pharmacy snapshot, and the metrics
//! counters the middleware and voice endpoint update.
//!
//! Configuration and metrics sit behind `Arc<RwLock<T>>` so many requests
//! can read while the occasional update takes the write lock. The pharmacy
//! store is read-only after startup and needs no lock at all.

use crate::config::AppConfig;
use crate::pharmacy::PharmacyStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all handlers and voice sessions.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration, updatable through the config endpoint
    pub config: Arc<RwLock<AppConfig>>,

    /// Read-only pharmacy dataset loaded at startup
    pub store: Arc<PharmacyStore>,

    /// Request and session counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started, for uptime reporting
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and voice sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since start
    pub request_count: u64,

    /// Total errors encountered since start
    pub error_count: u64,

    /// Currently connected voice sessions
    pub active_sessions: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, store: PharmacyStore) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            store: Arc::new(store),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Cloning releases the read
    /// lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
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

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Count a new voice session toward the concurrency limit, failing when
    /// the server is full. Check and increment are one critical section so
    /// two simultaneous connects cannot both squeeze past the limit.
    pub fn try_acquire_session(&self, max_sessions: usize) -> Result<(), usize> {
        let mut metrics = self.metrics.write().unwrap();
        if (metrics.active_sessions as usize) >= max_sessions {
            return Err(metrics.active_sessions as usize);
        }
        metrics.active_sessions += 1;
        Ok(())
    }

    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Underflow guard; u32 subtraction would panic
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> u32 {
        self.metrics.read().unwrap().active_sessions
    }

    /// Consistent copy of the metrics for the /metrics endpoint, so no lock
    /// is held while the response serializes.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(AppConfig::default(), PharmacyStore::bundled().unwrap())
    }

    #[test]
    fn test_session_capacity_gate() {
        let state = state();

        assert!(state.try_acquire_session(2).is_ok());
        assert!(state.try_acquire_session(2).is_ok());
        // Third connection is turned away with the current count
        assert_eq!(state.try_acquire_session(2), Err(2));

        state.decrement_active_sessions();
        assert!(state.try_acquire_session(2).is_ok());
    }

    #[test]
    fn test_session_count_never_underflows() {
        let state = state();
        state.decrement_active_sessions();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}

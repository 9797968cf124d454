//! Execution metrics
//!
//! Lock-free counters shared by the service and the `/metrics` handler.
//! One collector is built at start-up and handed to whoever needs it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::function::Runtime;

/// Counters for invocations and function lifecycle events
#[derive(Debug)]
pub struct Metrics {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
    created: AtomicU64,
    deleted: AtomicU64,
    runtime_usage: DashMap<Runtime, u64>,
    errors_by_kind: DashMap<&'static str, u64>,
    started: Instant,
    start_time: DateTime<Utc>,
}

/// Point-in-time copy of [`Metrics`], as served on `/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub function_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate_percent: f64,
    pub avg_execution_time_ms: f64,
    pub min_execution_time_ms: u64,
    pub max_execution_time_ms: u64,
    pub total_execution_time_ms: u64,
    pub created_functions: u64,
    pub deleted_functions: u64,
    pub runtime_usage: BTreeMap<String, u64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub start_time: DateTime<Utc>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
            created: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            runtime_usage: DashMap::new(),
            errors_by_kind: DashMap::new(),
            started: Instant::now(),
            start_time: Utc::now(),
        }
    }

    /// Record one finished invocation
    ///
    /// `error_kind` is ignored for successful invocations.
    pub fn record_execution(
        &self,
        runtime: Runtime,
        duration: Duration,
        success: bool,
        error_kind: Option<&'static str>,
    ) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_duration_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
        *self.runtime_usage.entry(runtime).or_insert(0) += 1;

        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(kind) = error_kind {
                *self.errors_by_kind.entry(kind).or_insert(0) += 1;
            }
        }
    }

    pub fn record_function_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_function_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);

        let (avg, rate) = if executions == 0 {
            (0.0, 0.0)
        } else {
            (
                total as f64 / executions as f64,
                successes as f64 / executions as f64 * 100.0,
            )
        };

        let min = match self.min_duration_ms.load(Ordering::Relaxed) {
            u64::MAX => 0,
            ms => ms,
        };

        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            function_executions: executions,
            successful_executions: successes,
            failed_executions: self.failures.load(Ordering::Relaxed),
            success_rate_percent: rate,
            avg_execution_time_ms: avg,
            min_execution_time_ms: min,
            max_execution_time_ms: self.max_duration_ms.load(Ordering::Relaxed),
            total_execution_time_ms: total,
            created_functions: self.created.load(Ordering::Relaxed),
            deleted_functions: self.deleted.load(Ordering::Relaxed),
            runtime_usage: self
                .runtime_usage
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            errors_by_type: self
                .errors_by_kind
                .iter()
                .map(|entry| ((*entry.key()).to_string(), *entry.value()))
                .collect(),
            start_time: self.start_time,
        }
    }
}

//! Metrics collection. `MetricsSink` is an injectable capability (never
//! global state) with a no-op default, mirroring the logger capability
//! pattern used throughout the crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::state_machine::TransitionRecord;
use crate::transport::BreakAttempt;

const TRANSITION_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub count: u64,
    pub sum: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
}

impl OperationStats {
    pub fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.sum / self.count as u32
        }
    }

    fn record(&mut self, elapsed: Duration, success: bool) {
        self.count += 1;
        self.sum += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }
}

/// A point-in-time view over the metrics collected so far, suitable for
/// `metrics_YYYYMMDD_HHMMSS.json` export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub operations: HashMap<String, OperationStatsView>,
    pub timeout_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_uptime: Option<Duration>,
    pub recent_transitions: Vec<TransitionRecord>,
    pub break_attempts: Vec<BreakAttempt>,
    pub rommon_entry_time: Option<DateTime<Local>>,
    pub boot_duration: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationStatsView {
    pub count: u64,
    pub sum_ms: u128,
    pub min_ms: Option<u128>,
    pub max_ms: Option<u128>,
    pub avg_ms: u128,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
}

impl From<&OperationStats> for OperationStatsView {
    fn from(s: &OperationStats) -> Self {
        OperationStatsView {
            count: s.count,
            sum_ms: s.sum.as_millis(),
            min_ms: s.min.map(|d| d.as_millis()),
            max_ms: s.max.map(|d| d.as_millis()),
            avg_ms: s.avg().as_millis(),
            successes: s.successes,
            failures: s.failures,
            retries: s.retries,
        }
    }
}

/// Capability interface for metrics collection. Implementations must be
/// cheap to call from any component; the default `Metrics` struct uses
/// internal locking so it can be shared via `&Metrics` across threads.
pub trait MetricsSink: Send + Sync {
    fn record_operation(&self, _operation: &str, _elapsed: Duration, _success: bool) {}
    fn record_retry(&self, _operation: &str) {}
    fn record_timeout(&self) {}
    fn record_bytes_sent(&self, _n: u64) {}
    fn record_bytes_received(&self, _n: u64) {}
    fn record_transition(&self, _record: &TransitionRecord) {}
    fn record_break_attempt(&self, _attempt: &BreakAttempt) {}
    fn start_connection(&self) {}
    fn record_rommon_entry(&self) {}
    fn record_boot_duration(&self, _d: Duration) {}
}

/// No-op metrics sink, the default when the caller doesn't care to collect.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[derive(Default)]
struct Inner {
    operations: HashMap<String, OperationStats>,
    timeout_count: u64,
    bytes_sent: u64,
    bytes_received: u64,
    connection_start: Option<Instant>,
    transitions: Vec<TransitionRecord>,
    break_attempts: Vec<BreakAttempt>,
    rommon_entry_time: Option<DateTime<Local>>,
    boot_duration: Option<Duration>,
}

/// Concrete, lock-protected metrics collector. Append/increment-only from
/// any number of components, as required by the concurrency model.
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let operations = inner
            .operations
            .iter()
            .map(|(k, v)| (k.clone(), v.into()))
            .collect();
        let start = inner.transitions.len().saturating_sub(TRANSITION_RING_CAPACITY);
        MetricsSnapshot {
            operations,
            timeout_count: inner.timeout_count,
            bytes_sent: inner.bytes_sent,
            bytes_received: inner.bytes_received,
            connection_uptime: inner.connection_start.map(|t| t.elapsed()),
            recent_transitions: inner.transitions[start..].to_vec(),
            break_attempts: inner.break_attempts.clone(),
            rommon_entry_time: inner.rommon_entry_time,
            boot_duration: inner.boot_duration,
        }
    }
}

impl MetricsSink for Metrics {
    fn record_operation(&self, operation: &str, elapsed: Duration, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .operations
            .entry(operation.to_string())
            .or_default()
            .record(elapsed, success);
    }

    fn record_retry(&self, operation: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.operations.entry(operation.to_string()).or_default().retries += 1;
    }

    fn record_timeout(&self) {
        self.inner.lock().unwrap().timeout_count += 1;
    }

    fn record_bytes_sent(&self, n: u64) {
        self.inner.lock().unwrap().bytes_sent += n;
    }

    fn record_bytes_received(&self, n: u64) {
        self.inner.lock().unwrap().bytes_received += n;
    }

    fn record_transition(&self, record: &TransitionRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.transitions.push(record.clone());
        if inner.transitions.len() > TRANSITION_RING_CAPACITY {
            let drop_n = inner.transitions.len() - TRANSITION_RING_CAPACITY;
            inner.transitions.drain(0..drop_n);
        }
    }

    fn record_break_attempt(&self, attempt: &BreakAttempt) {
        self.inner.lock().unwrap().break_attempts.push(attempt.clone());
    }

    fn start_connection(&self) {
        self.inner.lock().unwrap().connection_start = Some(Instant::now());
    }

    fn record_rommon_entry(&self) {
        self.inner.lock().unwrap().rommon_entry_time = Some(Local::now());
    }

    fn record_boot_duration(&self, d: Duration) {
        self.inner.lock().unwrap().boot_duration = Some(d);
    }
}

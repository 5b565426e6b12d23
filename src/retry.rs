//! Retry Policy (C3). Computes delays per named strategy and decides
//! retry-vs-surface per operation, as a closed tagged variant (not function
//! references) per the redesign note on polymorphism.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use rand::Rng;

use crate::error::RecoveryError;
use crate::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
    Immediate,
    Progressive,
    AdaptiveBackoff,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(60.0),
            strategy: RetryStrategy::ExponentialBackoff,
        }
    }
}

impl RetryConfig {
    fn new(max_retries: u32, base: f64, max: f64) -> Self {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_secs_f64(base),
            max_delay: Duration::from_secs_f64(max),
            strategy: RetryStrategy::ExponentialBackoff,
        }
    }

    /// `calc_delay(attempt)` is always clamped to `max_delay` for every
    /// `attempt >= 1`.
    pub fn calc_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let raw = match self.strategy {
            RetryStrategy::ExponentialBackoff => base * 2f64.powi(attempt as i32 - 1),
            RetryStrategy::LinearBackoff => base * attempt as f64,
            RetryStrategy::FixedDelay => base,
            RetryStrategy::Immediate => 0.0,
            RetryStrategy::Progressive => base * (attempt as f64).powf(1.5),
            RetryStrategy::AdaptiveBackoff => {
                let jitter = rand::thread_rng().gen_range(0.0..=base.max(0.0001));
                base * 2f64.powi(attempt as i32 - 1) + jitter
            }
        };
        Duration::from_secs_f64(raw.min(max).max(0.0))
    }
}

static DEFAULT_CONFIGS: Lazy<HashMap<&'static str, RetryConfig>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("break_sequence", RetryConfig::new(5, 0.5, 5.0));
    m.insert("rommon_entry", RetryConfig::new(3, 2.0, 30.0));
    m.insert("command_execution", RetryConfig::new(3, 1.0, 10.0));
    m.insert("config_save", RetryConfig::new(5, 2.0, 30.0));
    m
});

fn default_config_for(operation: &str) -> RetryConfig {
    DEFAULT_CONFIGS
        .get(operation)
        .copied()
        .unwrap_or_else(|| RetryConfig::new(3, 1.0, 60.0))
}

#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub operation: String,
    pub attempt: u32,
    pub error_kind: String,
    pub timestamp: DateTime<Local>,
}

/// Accumulates `RetryRecord`s across the session; read-only externally.
#[derive(Default)]
pub struct RetryHistory {
    records: Mutex<Vec<RetryRecord>>,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RetryRecord> {
        self.records.lock().unwrap().clone()
    }

    fn push(&self, record: RetryRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Retries `thunk` under `config` (or the operation's default), consulting
/// `permanent` to short-circuit on errors that should never be retried.
/// `on_retry`, if given, runs before each sleep and must not itself panic
/// the caller out of the retry loop (errors from it are swallowed).
pub fn retry<T>(
    operation: &str,
    history: &RetryHistory,
    metrics: &dyn MetricsSink,
    config: Option<RetryConfig>,
    mut thunk: impl FnMut(u32) -> Result<T, RecoveryError>,
    mut on_retry: Option<impl FnMut(u32, &RecoveryError)>,
) -> Result<T, RecoveryError> {
    let config = config.unwrap_or_else(|| default_config_for(operation));

    for attempt in 1..=config.max_retries {
        let start = Instant::now();
        match thunk(attempt) {
            Ok(v) => {
                metrics.record_operation(operation, start.elapsed(), true);
                return Ok(v);
            }
            Err(e) => {
                metrics.record_operation(operation, start.elapsed(), false);

                // A permanent error, or exhausting the last attempt, goes
                // straight to surfacing: no retry record, no callback, no
                // sleep. Only attempts strictly before the last one get
                // logged as a retry.
                if e.is_permanent() || attempt >= config.max_retries {
                    return Err(e);
                }

                metrics.record_retry(operation);
                history.push(RetryRecord {
                    operation: operation.to_string(),
                    attempt,
                    error_kind: format!("{}", e),
                    timestamp: Local::now(),
                });

                if let Some(cb) = on_retry.as_mut() {
                    cb(attempt, &e);
                }

                let delay = config.calc_delay(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }

    Err(RecoveryError::Other(anyhow::anyhow!(
        "{} called with zero max_retries",
        operation
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max_for_any_strategy() {
        let strategies = [
            RetryStrategy::ExponentialBackoff,
            RetryStrategy::LinearBackoff,
            RetryStrategy::FixedDelay,
            RetryStrategy::Immediate,
            RetryStrategy::Progressive,
            RetryStrategy::AdaptiveBackoff,
        ];
        for s in strategies {
            let cfg = RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_secs_f64(2.0),
                max_delay: Duration::from_secs_f64(3.0),
                strategy: s,
            };
            for attempt in 1..=20u32 {
                assert!(cfg.calc_delay(attempt) <= cfg.max_delay);
            }
        }
    }

    #[test]
    fn exponential_grows_then_clamps() {
        let cfg = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(10.0),
            strategy: RetryStrategy::ExponentialBackoff,
        };
        assert_eq!(cfg.calc_delay(1), Duration::from_secs_f64(1.0));
        assert_eq!(cfg.calc_delay(2), Duration::from_secs_f64(2.0));
        assert_eq!(cfg.calc_delay(10), cfg.max_delay);
    }

    #[test]
    fn permanent_error_short_circuits_without_recording_retry() {
        let history = RetryHistory::new();
        let metrics = crate::metrics::NoopMetrics;
        let result: Result<(), RecoveryError> = retry(
            "command_execution",
            &history,
            &metrics,
            None,
            |_attempt| Err(RecoveryError::CommandSyntax("bad command".into())),
            None::<fn(u32, &RecoveryError)>,
        );
        assert!(result.is_err());
        assert!(history.records().is_empty());
    }

    #[test]
    fn exhausting_retries_records_one_entry_per_failed_attempt_but_last() {
        let history = RetryHistory::new();
        let metrics = crate::metrics::NoopMetrics;
        let cfg = RetryConfig::new(3, 0.0, 0.0);
        let result: Result<(), RecoveryError> = retry(
            "command_execution",
            &history,
            &metrics,
            Some(cfg),
            |_attempt| Err(RecoveryError::Timeout { operation: "x".into(), after: Duration::from_secs(1) }),
            None::<fn(u32, &RecoveryError)>,
        );
        assert!(result.is_err());
        assert_eq!(history.records().len(), 2);
    }
}

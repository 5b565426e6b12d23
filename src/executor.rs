//! Command Executor (C4). Ties transport, detector, and retry together into
//! request/response semantics over a line-oriented console.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::RecoveryError;
use crate::metrics::MetricsSink;
use crate::prompt::{PromptDetector, RouterMode};
use crate::retry::{self, RetryConfig, RetryHistory, RetryStrategy};
use crate::transport::SerialTransport;

const MORE_PROMPT: &str = "--More--";

/// Outcome of a single `execute_once_classified` poll loop, distinguishing
/// a permanent syntax-class rejection from a plain deadline timeout so the
/// retry layer can treat them differently.
enum ExecOutcome {
    Success(String),
    ErrorPrompt(String),
    Timeout(String),
}

pub struct CommandExecutor {
    transport: Arc<std::sync::Mutex<SerialTransport>>,
    detector: std::sync::Mutex<PromptDetector>,
    retry_history: RetryHistory,
    metrics: Arc<dyn MetricsSink>,
}

impl CommandExecutor {
    pub fn new(transport: Arc<std::sync::Mutex<SerialTransport>>, metrics: Arc<dyn MetricsSink>) -> Self {
        CommandExecutor {
            transport,
            detector: std::sync::Mutex::new(PromptDetector::new()),
            retry_history: RetryHistory::new(),
            metrics,
        }
    }

    /// `execute(command, expected_mode, timeout, retry, wait_for_echo)`.
    /// Only the first whitespace-token of `command` is used for metric
    /// naming.
    pub fn execute(
        &self,
        command: &str,
        expected_mode: Option<&RouterMode>,
        timeout: Duration,
        retry: bool,
        wait_for_echo: bool,
    ) -> (bool, String) {
        if retry {
            let op_name = format!(
                "execute_{}",
                command.split_whitespace().next().unwrap_or(command)
            );
            let config = RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_secs_f64(1.0),
                max_delay: Duration::from_secs_f64(10.0),
                strategy: RetryStrategy::ExponentialBackoff,
            };

            let result: std::result::Result<(bool, String), RecoveryError> = retry::retry(
                &op_name,
                &self.retry_history,
                self.metrics.as_ref(),
                Some(config),
                |_attempt| {
                    match self.execute_once_classified(command, expected_mode, timeout, wait_for_echo) {
                        ExecOutcome::Success(output) => Ok((true, output)),
                        // A command rejected with an IOS `% Invalid`/`%
                        // Error`-class prompt is a syntax-class error, not a
                        // transient one: per §4.4's `permanent_errors =
                        // {syntax-class errors}`, it short-circuits the
                        // retry loop instead of being retried 3x.
                        ExecOutcome::ErrorPrompt(output) => {
                            Err(RecoveryError::CommandSyntax(output))
                        }
                        ExecOutcome::Timeout(_) => {
                            Err(RecoveryError::Timeout { operation: op_name.clone(), after: timeout })
                        }
                    }
                },
                None::<fn(u32, &RecoveryError)>,
            );

            match result {
                Ok(v) => v,
                Err(e) => (false, format!("{}", e)),
            }
        } else {
            self.execute_once(command, expected_mode, timeout, wait_for_echo)
        }
    }

    /// Collapses `execute_once_classified`'s three-way outcome to the plain
    /// `(bool, String)` surface used by the non-retrying callers and by
    /// `execute`'s own retry-disabled path.
    fn execute_once(
        &self,
        command: &str,
        expected_mode: Option<&RouterMode>,
        timeout: Duration,
        wait_for_echo: bool,
    ) -> (bool, String) {
        match self.execute_once_classified(command, expected_mode, timeout, wait_for_echo) {
            ExecOutcome::Success(output) => (true, output),
            ExecOutcome::ErrorPrompt(output) | ExecOutcome::Timeout(output) => (false, output),
        }
    }

    /// Same algorithm as `execute_once`, but distinguishes an IOS
    /// `Error`-prompt classification from a plain deadline timeout - the
    /// retry layer needs that distinction to treat the former as permanent.
    fn execute_once_classified(
        &self,
        command: &str,
        expected_mode: Option<&RouterMode>,
        timeout: Duration,
        wait_for_echo: bool,
    ) -> ExecOutcome {
        let start = Instant::now();
        tracing::trace!(target: crate::logging::COMMAND_TARGET, command, "executing");

        {
            let transport = self.transport.lock().unwrap();
            transport.clear_output_buffer();
        }

        let written = {
            let mut transport = self.transport.lock().unwrap();
            transport.write(command).unwrap_or(0)
        };
        if written == 0 {
            return ExecOutcome::Timeout("Failed to write command".to_string());
        }

        if wait_for_echo {
            let echo_timeout = Duration::from_secs_f64(2.0).min(timeout / 3);
            let echo_output = {
                let transport = self.transport.lock().unwrap();
                transport.read_output(echo_timeout)
            };
            if !echo_output.contains(command.trim()) {
                tracing::debug!(target: crate::logging::COMMAND_TARGET, "command echo not detected, continuing anyway");
            }
        }

        let mut output = String::new();
        let deadline = start + timeout;

        while Instant::now() < deadline {
            let chunk = {
                let transport = self.transport.lock().unwrap();
                transport.read_output(Duration::from_millis(500))
            };

            if !chunk.is_empty() {
                output.push_str(&chunk);

                // Checked against the fresh chunk, not the cumulative
                // `output`, and stripped out afterward - otherwise the
                // marker would linger in `output` forever once seen once,
                // and the final result would never be free of it.
                if chunk.contains(MORE_PROMPT) {
                    output = output.replace(MORE_PROMPT, "");
                    let mut transport = self.transport.lock().unwrap();
                    let _ = transport.write(" ");
                    drop(transport);
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }

                let detected = self.detector.lock().unwrap().detect(&output);
                if let Some((mode, _)) = detected {
                    if let RouterMode::Error { .. } = mode {
                        let elapsed = start.elapsed();
                        self.metrics.record_operation(command, elapsed, false);
                        tracing::trace!(target: crate::logging::COMMAND_TARGET, command, success = false, "error prompt");
                        return ExecOutcome::ErrorPrompt(output);
                    }

                    if expected_mode.is_none() || expected_mode.map_or(false, |e| mode.same_family(e)) {
                        let elapsed = start.elapsed();
                        self.metrics.record_operation(command, elapsed, true);
                        tracing::trace!(target: crate::logging::COMMAND_TARGET, command, success = true, "expected prompt matched");
                        return ExecOutcome::Success(output);
                    }
                }
            }

            std::thread::sleep(Duration::from_millis(100));
        }

        self.metrics.record_timeout();
        self.metrics.record_operation(command, start.elapsed(), false);
        tracing::warn!(target: crate::logging::COMMAND_TARGET, command, "command execution timeout");
        ExecOutcome::Timeout(output)
    }

    pub fn enter_config_mode(&self) -> bool {
        let target = RouterMode::ConfigMode { host: String::new(), submode: None };
        let (success, _) = self.execute(
            "configure terminal",
            Some(&target),
            Duration::from_secs(10),
            true,
            true,
        );
        success
    }

    pub fn exit_config_mode(&self) -> bool {
        let target = RouterMode::PrivilegedMode { host: String::new() };
        let (success, _) = self.execute("end", Some(&target), Duration::from_secs(10), true, true);
        if success {
            return true;
        }
        let (success, _) = self.execute("exit", Some(&target), Duration::from_secs(10), true, true);
        success
    }

    /// `copy running-config <target>`, 60s. Accepts the `Destination
    /// filename` prompt by sending CR and continuing to read for 10s more.
    pub fn save_config(&self, target: &str) -> bool {
        let command = format!("copy running-config {}", target);
        let (_, mut output) = self.execute(&command, None, Duration::from_secs(60), true, true);

        if output.contains("Destination filename") {
            let mut transport = self.transport.lock().unwrap();
            let _ = transport.write("\r");
            drop(transport);
            std::thread::sleep(Duration::from_secs(1));
            let transport = self.transport.lock().unwrap();
            output.push_str(&transport.read_output(Duration::from_secs(10)));
        }

        output.to_lowercase().contains("bytes copied") || output.contains("[OK]")
    }

    /// Sends `pw\r` without waiting for echo, then sleeps 0.5s.
    pub fn send_password(&self, password: &str) -> bool {
        let payload = format!("{}\r", password);
        let written = {
            let mut transport = self.transport.lock().unwrap();
            transport.write(&payload).unwrap_or(0)
        };
        std::thread::sleep(Duration::from_millis(500));
        written > 0
    }

    pub fn transport(&self) -> Arc<std::sync::Mutex<SerialTransport>> {
        self.transport.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn executor() -> CommandExecutor {
        let transport = Arc::new(std::sync::Mutex::new(SerialTransport::new(Arc::new(NoopMetrics))));
        CommandExecutor::new(transport, Arc::new(NoopMetrics))
    }

    #[test]
    fn execute_against_closed_port_fails_fast() {
        let exec = executor();
        let (success, output) = exec.execute("show version", None, Duration::from_millis(50), false, false);
        assert!(!success);
        assert_eq!(output, "Failed to write command");
    }

    #[test]
    fn save_config_rejects_output_without_markers() {
        let exec = executor();
        assert!(!exec.save_config("startup-config"));
    }

    fn simulated_executor() -> (CommandExecutor, Arc<std::sync::Mutex<SerialTransport>>) {
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let transport = Arc::new(std::sync::Mutex::new(SerialTransport::new_simulated(metrics.clone())));
        let exec = CommandExecutor::new(transport.clone(), metrics);
        (exec, transport)
    }

    #[test]
    fn pagination_is_absorbed_into_a_single_prompt_terminated_output() {
        let (exec, transport) = simulated_executor();

        // `read_output` polls for a full 500ms window per call regardless of
        // when data arrives inside it, so the two injections are spaced to
        // land in two distinct windows (the 100ms sleep after a `--More--`
        // hit pushes window two's start to ~600ms).
        let t2 = transport.clone();
        let injector = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            t2.lock().unwrap().simulate_incoming("interface line one\n--More--");
            std::thread::sleep(Duration::from_millis(650));
            t2.lock().unwrap().simulate_incoming(" interface line two\nRouter#");
        });

        let (success, output) =
            exec.execute("show running-config", None, Duration::from_secs(3), false, false);
        injector.join().unwrap();

        assert!(success);
        assert!(!output.contains(MORE_PROMPT));
        assert!(output.contains("interface line one"));
        assert!(output.contains("interface line two"));
        assert!(output.trim_end().ends_with("Router#"));
    }

    #[test]
    fn silent_line_times_out_after_the_requested_deadline() {
        let (exec, _transport) = simulated_executor();
        let start = Instant::now();
        let (success, output) =
            exec.execute("show version", None, Duration::from_millis(300), false, false);
        assert!(!success);
        assert_eq!(output, "");
        // Bounded by poll granularity (500ms read_output steps), so allow
        // one extra step of slack above the requested deadline.
        assert!(start.elapsed() < Duration::from_millis(300) + Duration::from_millis(600));
    }
}

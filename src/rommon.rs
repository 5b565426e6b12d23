//! ROM-Monitor Driver (C6). Drives break entry, config-register rewrite, and
//! the reboot/reboot-wait cycle that hands control back to IOS.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::metrics::MetricsSink;
use crate::prompt::{PromptDetector, RouterMode};
use crate::retry::{self, RetryConfig, RetryHistory, RetryStrategy};
use crate::state_machine::{RecoveryState, RecoveryStateMachine};
use crate::transport::SerialTransport;

const MAX_BREAK_ATTEMPTS: u32 = 5;
const BREAK_ATTEMPT_INTERVAL: Duration = Duration::from_secs(2);

pub struct RommonDriver {
    transport: Arc<std::sync::Mutex<SerialTransport>>,
    detector: std::sync::Mutex<PromptDetector>,
    state_machine: Arc<std::sync::Mutex<RecoveryStateMachine>>,
    retry_history: RetryHistory,
    metrics: Arc<dyn MetricsSink>,
}

impl RommonDriver {
    pub fn new(
        transport: Arc<std::sync::Mutex<SerialTransport>>,
        state_machine: Arc<std::sync::Mutex<RecoveryStateMachine>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        RommonDriver {
            transport,
            detector: std::sync::Mutex::new(PromptDetector::new()),
            state_machine,
            retry_history: RetryHistory::new(),
            metrics,
        }
    }

    pub fn wait_for_boot(&self, timeout: Duration) -> bool {
        tracing::info!("waiting for boot sequence");
        self.state_machine
            .lock()
            .unwrap()
            .transition(RecoveryState::WaitingBoot, "waiting for boot", None);

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let output = {
                let t = self.transport.lock().unwrap();
                t.get_output_buffer()
            };
            if let Some((RouterMode::Booting, _)) = self.detector.lock().unwrap().detect(&output) {
                tracing::info!("boot sequence detected");
                return true;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        false
    }

    /// Attempts up to 5 break cycles, spaced 2s apart, checking for ROM
    /// monitor classification 1s after each successful break signal.
    pub fn send_break_sequence(&self, timeout: Duration) -> bool {
        tracing::info!("sending break sequence");
        self.state_machine
            .lock()
            .unwrap()
            .transition(RecoveryState::SendingBreak, "sending break sequence", None);

        let start = Instant::now();

        for attempt in 1..=MAX_BREAK_ATTEMPTS {
            if start.elapsed() > timeout {
                break;
            }

            tracing::debug!(attempt, max = MAX_BREAK_ATTEMPTS, "break attempt");

            let sent = {
                let mut t = self.transport.lock().unwrap();
                t.send_break().unwrap_or(false)
            };

            if sent {
                std::thread::sleep(Duration::from_secs(1));
                let output = {
                    let t = self.transport.lock().unwrap();
                    t.get_output_buffer()
                };
                if let Some((RouterMode::RomMonitor, _)) =
                    self.detector.lock().unwrap().detect(&output)
                {
                    self.metrics.record_rommon_entry();
                    tracing::info!(attempt, "ROM monitor entered");
                    self.state_machine
                        .lock()
                        .unwrap()
                        .transition(RecoveryState::RomMonitor, "entered ROM monitor", None);
                    return true;
                }
            }

            if attempt < MAX_BREAK_ATTEMPTS {
                std::thread::sleep(BREAK_ATTEMPT_INTERVAL);
            }
        }

        tracing::error!("failed to enter ROM monitor after break sequence");
        false
    }

    /// Sets the config register, verifying the write with a word-boundary
    /// match on the hex token rather than a plain substring search (a bare
    /// substring would spuriously match when the echoed value is a prefix of
    /// something else in the prompt, e.g. `0x2142` inside `0x21420`).
    pub fn set_config_register(&self, value: &str) -> bool {
        tracing::info!(value, "setting configuration register");

        let boundary = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(value))).unwrap();
        let config = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs_f64(2.0),
            max_delay: Duration::from_secs_f64(60.0),
            strategy: RetryStrategy::ExponentialBackoff,
        };

        let result: Result<bool, crate::error::RecoveryError> = retry::retry(
            "set_confreg",
            &self.retry_history,
            self.metrics.as_ref(),
            Some(config),
            |_attempt| {
                let command = format!("confreg {}", value);
                {
                    let mut t = self.transport.lock().unwrap();
                    let _ = t.write(&command);
                }
                std::thread::sleep(Duration::from_secs_f64(1.0));

                let output = {
                    let t = self.transport.lock().unwrap();
                    t.read_output(Duration::from_secs_f64(5.0))
                };

                if boundary.is_match(&output) {
                    return Ok(true);
                }

                let verify_output = {
                    let mut t = self.transport.lock().unwrap();
                    let _ = t.write("confreg");
                    drop(t);
                    std::thread::sleep(Duration::from_secs_f64(1.0));
                    let t = self.transport.lock().unwrap();
                    t.read_output(Duration::from_secs_f64(5.0))
                };

                Ok(boundary.is_match(&verify_output))
            },
            None::<fn(u32, &crate::error::RecoveryError)>,
        );

        match result {
            Ok(true) => {
                self.state_machine.lock().unwrap().transition(
                    RecoveryState::ConfigRegSet,
                    &format!("config register set to {}", value),
                    None,
                );
                tracing::info!(value, "configuration register set");
                true
            }
            _ => {
                tracing::error!("failed to set configuration register");
                false
            }
        }
    }

    pub fn reboot_router(&self) -> bool {
        tracing::info!("rebooting router");
        self.state_machine
            .lock()
            .unwrap()
            .transition(RecoveryState::Rebooting, "rebooting router", None);

        {
            let mut t = self.transport.lock().unwrap();
            let _ = t.write("reset");
        }
        std::thread::sleep(Duration::from_secs_f64(2.0));

        {
            let t = self.transport.lock().unwrap();
            t.clear_output_buffer();
        }

        tracing::info!("reset command sent, waiting for reboot");
        true
    }

    pub fn wait_for_ios_boot(&self, timeout: Duration) -> bool {
        tracing::info!("waiting for IOS to boot");
        let start = Instant::now();
        let mut boot_start = start;

        while start.elapsed() < timeout {
            let output = {
                let t = self.transport.lock().unwrap();
                t.get_output_buffer()
            };

            let detected = self.detector.lock().unwrap().detect(&output);

            match detected {
                Some((RouterMode::Booting, _)) => {
                    boot_start = Instant::now();
                }
                Some((mode @ RouterMode::PrivilegedMode { .. }, _))
                | Some((mode @ RouterMode::UserMode { .. }, _)) => {
                    let boot_duration = boot_start.elapsed();
                    self.metrics.record_boot_duration(boot_duration);
                    tracing::info!(?mode, "IOS booted successfully");
                    self.state_machine.lock().unwrap().transition(
                        RecoveryState::IosNoConfig,
                        "IOS booted without startup config",
                        None,
                    );
                    return true;
                }
                _ => {}
            }

            std::thread::sleep(Duration::from_millis(500));
        }

        tracing::error!("timeout waiting for IOS boot");
        false
    }

    pub fn enter_rommon(&self, boot_timeout: Duration, break_timeout: Duration) -> bool {
        if !self.wait_for_boot(boot_timeout) {
            tracing::warn!("boot sequence not detected, attempting break anyway");
        }
        self.send_break_sequence(break_timeout)
    }

    /// Enter ROM monitor, set confreg to 0x2142, reboot, and wait for IOS.
    pub fn complete_recovery_setup(&self) -> bool {
        if !self.enter_rommon(Duration::from_secs(60), Duration::from_secs(60)) {
            return false;
        }
        if !self.set_config_register("0x2142") {
            return false;
        }
        if !self.reboot_router() {
            return false;
        }
        self.wait_for_ios_boot(Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn driver() -> RommonDriver {
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let transport = Arc::new(std::sync::Mutex::new(SerialTransport::new(metrics.clone())));
        let sm = Arc::new(std::sync::Mutex::new(RecoveryStateMachine::new(metrics.clone())));
        RommonDriver::new(transport, sm, metrics)
    }

    #[test]
    fn word_boundary_does_not_match_extended_hex_token() {
        let boundary = Regex::new(&format!(r"(?i)\b{}\b", regex::escape("0x2142"))).unwrap();
        assert!(!boundary.is_match("confreg is 0x21420 now"));
        assert!(boundary.is_match("confreg is 0x2142 now"));
    }

    #[test]
    fn reboot_router_clears_buffer_and_succeeds_against_closed_transport() {
        let driver = driver();
        assert!(driver.reboot_router());
    }

    #[test]
    fn wait_for_boot_times_out_on_silent_port() {
        let driver = driver();
        assert!(!driver.wait_for_boot(Duration::from_millis(50)));
    }

    #[test]
    fn break_sequence_exhausts_all_five_attempts_and_stays_in_sending_break() {
        let metrics = Arc::new(crate::metrics::Metrics::new());
        let metrics_sink: Arc<dyn MetricsSink> = metrics.clone();
        let transport = Arc::new(std::sync::Mutex::new(SerialTransport::new_simulated(
            metrics_sink.clone(),
        )));
        for _ in 0..MAX_BREAK_ATTEMPTS {
            transport.lock().unwrap().push_simulated_break_outcome(false);
        }
        let sm = Arc::new(std::sync::Mutex::new(RecoveryStateMachine::new(
            metrics_sink.clone(),
        )));
        let driver = RommonDriver::new(transport, sm.clone(), metrics_sink);

        let entered = driver.send_break_sequence(Duration::from_secs(30));

        assert!(!entered);
        assert_eq!(sm.lock().unwrap().current(), RecoveryState::SendingBreak);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.break_attempts.len(), MAX_BREAK_ATTEMPTS as usize);
        assert!(snapshot.break_attempts.iter().all(|a| !a.success));
    }
}

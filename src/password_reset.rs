//! Password-Reset Workflow (C7). Composes the command executor and state
//! machine into the enable-secret / console / VTY / confreg-restore / save
//! / verify sequence.

use std::io::{self, Write as _};
use std::time::Duration;

use crate::executor::CommandExecutor;
use crate::prompt::RouterMode;
use crate::state_machine::{RecoveryState, RecoveryStateMachine};

/// Password entry is a boundary effect, parameterized so tests can inject
/// fixed values and production can wire an echoless terminal reader without
/// this module depending on any particular TUI.
pub trait PasswordSource {
    fn obtain(&self, prompt: &str) -> io::Result<String>;
}

/// Reads a line from stdin; input is echoed (no termios raw-mode handling -
/// an echoless reader is a TUI concern, out of scope here).
pub struct StdinPasswordSource;

impl PasswordSource for StdinPasswordSource {
    fn obtain(&self, prompt: &str) -> io::Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[derive(Clone)]
pub struct FixedPassword(pub String);

impl PasswordSource for FixedPassword {
    fn obtain(&self, _prompt: &str) -> io::Result<String> {
        Ok(self.0.clone())
    }
}

pub struct PasswordReset<'a> {
    executor: &'a CommandExecutor,
    state_machine: &'a std::sync::Mutex<RecoveryStateMachine>,
    source: &'a dyn PasswordSource,
    interactive: bool,
}

impl<'a> PasswordReset<'a> {
    pub fn new(
        executor: &'a CommandExecutor,
        state_machine: &'a std::sync::Mutex<RecoveryStateMachine>,
        source: &'a dyn PasswordSource,
        interactive: bool,
    ) -> Self {
        PasswordReset { executor, state_machine, source, interactive }
    }

    /// Verifies the router answers `show version` in privileged mode
    /// without a password, i.e. ROM-monitor recovery has already landed us
    /// past any enable password.
    pub fn verify_privileged_access(&self) -> bool {
        tracing::info!("verifying privileged access");
        let privileged = RouterMode::PrivilegedMode { host: String::new() };
        let (success, _) = self.executor.execute(
            "show version",
            Some(&privileged),
            Duration::from_secs(10),
            true,
            true,
        );
        if success {
            tracing::info!("privileged access verified (no password required)");
        } else {
            tracing::warn!("privileged access not available");
        }
        success
    }

    fn get_password_input(&self, prompt: &str, confirm: bool) -> Option<String> {
        if !self.interactive {
            tracing::warn!("not in interactive mode, cannot get password");
            return None;
        }

        let password = self.source.obtain(prompt).ok()?;
        if password.is_empty() {
            return None;
        }

        if confirm {
            let confirmation = self.source.obtain("Confirm password: ").ok()?;
            if password != confirmation {
                tracing::error!("passwords do not match");
                return None;
            }
        }

        Some(password)
    }

    pub fn reset_enable_secret(&self, password: Option<String>) -> bool {
        tracing::info!("resetting enable secret password");
        self.state_machine.lock().unwrap().transition(
            RecoveryState::PasswordReset,
            "resetting enable secret",
            None,
        );

        let password = match password.or_else(|| {
            self.get_password_input("Enter new enable secret password: ", true)
        }) {
            Some(p) => p,
            None => return false,
        };

        if !self.executor.enter_config_mode() {
            tracing::error!("failed to enter configuration mode");
            return false;
        }

        let config_mode = RouterMode::ConfigMode { host: String::new(), submode: None };
        let command = format!("enable secret {}", password);
        let (success, _) = self.executor.execute(
            &command,
            Some(&config_mode),
            Duration::from_secs(10),
            true,
            true,
        );

        if !success {
            tracing::error!("failed to set enable secret");
            self.executor.exit_config_mode();
            return false;
        }

        if !self.executor.exit_config_mode() {
            tracing::warn!("failed to exit configuration mode");
        }

        tracing::info!("enable secret password reset successfully");
        true
    }

    /// Optional. `None` password from a non-interactive caller, or an empty
    /// interactive answer, is treated as "user skipped" (success).
    pub fn reset_console_password(&self, password: Option<String>) -> bool {
        let password = match password.or_else(|| {
            if !self.interactive {
                return None;
            }
            self.get_password_input(
                "Enter new console password (optional, press Enter to skip): ",
                false,
            )
        }) {
            Some(p) => p,
            None => return self.interactive,
        };

        tracing::info!("resetting console password");
        self.apply_line_password("line console 0", &password)
    }

    pub fn reset_vty_password(&self, password: Option<String>) -> bool {
        let password = match password.or_else(|| {
            if !self.interactive {
                return None;
            }
            self.get_password_input(
                "Enter new VTY password (optional, press Enter to skip): ",
                false,
            )
        }) {
            Some(p) => p,
            None => return self.interactive,
        };

        tracing::info!("resetting VTY password");
        self.apply_line_password("line vty 0 4", &password)
    }

    fn apply_line_password(&self, line_command: &str, password: &str) -> bool {
        if !self.executor.enter_config_mode() {
            return false;
        }

        let config_mode = RouterMode::ConfigMode { host: String::new(), submode: None };
        let commands = [
            line_command.to_string(),
            format!("password {}", password),
            "login".to_string(),
        ];

        for cmd in &commands {
            let (success, _) = self.executor.execute(
                cmd,
                Some(&config_mode),
                Duration::from_secs(5),
                true,
                true,
            );
            if !success {
                self.executor.exit_config_mode();
                return false;
            }
        }

        self.executor.exit_config_mode();
        tracing::info!("line password reset successfully");
        true
    }

    pub fn restore_config_register(&self) -> bool {
        tracing::info!("restoring configuration register to 0x2102");
        if !self.executor.enter_config_mode() {
            return false;
        }

        let config_mode = RouterMode::ConfigMode { host: String::new(), submode: None };
        let (success, _) = self.executor.execute(
            "config-register 0x2102",
            Some(&config_mode),
            Duration::from_secs(10),
            true,
            true,
        );

        if !success {
            self.executor.exit_config_mode();
            return false;
        }

        self.executor.exit_config_mode();
        tracing::info!("configuration register restored to 0x2102");
        true
    }

    pub fn save_configuration(&self) -> bool {
        tracing::info!("saving configuration");
        self.state_machine.lock().unwrap().transition(
            RecoveryState::ConfigSaved,
            "saving configuration",
            None,
        );

        let success = self.executor.save_config("startup-config");
        if success {
            tracing::info!("configuration saved successfully");
        } else {
            tracing::error!("failed to save configuration");
        }
        success
    }

    pub fn verify_password_reset(&self) -> bool {
        tracing::info!("verifying password reset");
        let (success, output) = self.executor.execute(
            "show running-config | include enable secret",
            None,
            Duration::from_secs(10),
            true,
            true,
        );

        if success && output.to_lowercase().contains("enable secret") {
            tracing::info!("password reset verified in running configuration");
            true
        } else {
            tracing::warn!("could not verify password reset");
            false
        }
    }

    /// Transitions to `Complete` only when the final verification step also
    /// succeeds; a save that works but whose verify fails leaves the machine
    /// in `ConfigSaved`, never falsely reporting `Complete`.
    pub fn complete_password_reset(
        &self,
        enable_password: Option<String>,
        console_password: Option<String>,
        vty_password: Option<String>,
    ) -> bool {
        if !self.verify_privileged_access() {
            return false;
        }

        if !self.reset_enable_secret(enable_password) {
            return false;
        }

        if console_password.is_some() || self.interactive {
            self.reset_console_password(console_password);
        }

        if vty_password.is_some() || self.interactive {
            self.reset_vty_password(vty_password);
        }

        if !self.restore_config_register() {
            return false;
        }

        if !self.save_configuration() {
            return false;
        }

        let verified = self.verify_password_reset();
        if verified {
            self.state_machine.lock().unwrap().transition(
                RecoveryState::Complete,
                "password reset complete",
                None,
            );
        }

        verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::{Arc, Mutex};

    fn harness() -> (CommandExecutor, Mutex<RecoveryStateMachine>) {
        let metrics: Arc<dyn crate::metrics::MetricsSink> = Arc::new(NoopMetrics);
        let transport = Arc::new(Mutex::new(crate::transport::SerialTransport::new(metrics.clone())));
        let executor = CommandExecutor::new(transport, metrics.clone());
        let sm = Mutex::new(RecoveryStateMachine::new(metrics));
        (executor, sm)
    }

    #[test]
    fn non_interactive_without_password_fails_enable_secret_reset() {
        let (executor, sm) = harness();
        let source = FixedPassword("unused".into());
        let reset = PasswordReset::new(&executor, &sm, &source, false);
        assert!(!reset.reset_enable_secret(None));
    }

    #[test]
    fn optional_console_password_skip_reports_success_when_interactive_with_empty_answer() {
        let (executor, sm) = harness();
        let source = FixedPassword(String::new());
        let reset = PasswordReset::new(&executor, &sm, &source, true);
        assert!(reset.reset_console_password(None));
    }

    #[test]
    fn optional_console_password_skip_reports_failure_when_noninteractive() {
        let (executor, sm) = harness();
        let source = FixedPassword(String::new());
        let reset = PasswordReset::new(&executor, &sm, &source, false);
        assert!(!reset.reset_console_password(None));
    }

    #[test]
    fn complete_workflow_against_closed_transport_never_reaches_complete() {
        let (executor, sm) = harness();
        let source = FixedPassword("NewPw1!".into());
        let reset = PasswordReset::new(&executor, &sm, &source, false);
        assert!(!reset.complete_password_reset(Some("NewPw1!".into()), None, None));
        assert_ne!(sm.lock().unwrap().current(), RecoveryState::Complete);
    }
}

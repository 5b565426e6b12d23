//! Recovery State Machine (C5). Gates legal transitions, records history,
//! and supports checkpoint/rollback.

use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecoveryState {
    Initial,
    Connected,
    WaitingBoot,
    SendingBreak,
    RomMonitor,
    ConfigRegSet,
    Rebooting,
    IosNoConfig,
    SystemDetection,
    PasswordReset,
    ConfigSaved,
    Complete,
    Error,
    Rollback,
}

impl RecoveryState {
    fn legal_targets(self) -> &'static [RecoveryState] {
        use RecoveryState::*;
        match self {
            Initial => &[Connected, Error],
            Connected => &[WaitingBoot, Error],
            WaitingBoot => &[SendingBreak, Error],
            SendingBreak => &[RomMonitor, SendingBreak, Error],
            RomMonitor => &[ConfigRegSet, Error],
            ConfigRegSet => &[Rebooting, Error],
            Rebooting => &[IosNoConfig, Error],
            IosNoConfig => &[SystemDetection, PasswordReset, Error],
            SystemDetection => &[PasswordReset, Error],
            PasswordReset => &[ConfigSaved, Error],
            ConfigSaved => &[Complete, Error],
            Error => &[Rollback, Initial],
            Rollback => &[Initial, Error],
            Complete => &[],
        }
    }

    /// Only `Complete` has no legal outgoing edge. `Error` is restricted
    /// (only `Rollback`/`Initial`) but NOT terminal - it must stay able to
    /// transition.
    pub fn is_terminal(self) -> bool {
        self == RecoveryState::Complete
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: RecoveryState,
    pub to: RecoveryState,
    pub timestamp: DateTime<Local>,
    pub reason: String,
    pub data: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StateCheckpoint {
    pub state: RecoveryState,
    pub wall_time: DateTime<Local>,
    pub original_confreg: Option<String>,
    pub config_backup: Option<String>,
    pub user_data: std::collections::HashMap<String, String>,
}

pub struct RecoveryStateMachine {
    current: RecoveryState,
    history: Vec<TransitionRecord>,
    checkpoints: Vec<StateCheckpoint>,
    original_confreg: Option<String>,
    config_backup: Option<String>,
    state_entered_at: Instant,
    metrics: std::sync::Arc<dyn crate::metrics::MetricsSink>,
}

impl RecoveryStateMachine {
    pub fn new(metrics: std::sync::Arc<dyn crate::metrics::MetricsSink>) -> Self {
        RecoveryStateMachine {
            current: RecoveryState::Initial,
            history: Vec::new(),
            checkpoints: Vec::new(),
            original_confreg: None,
            config_backup: None,
            state_entered_at: Instant::now(),
            metrics,
        }
    }

    pub fn current(&self) -> RecoveryState {
        self.current
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Returns true and records one history entry iff the edge is legal.
    /// Illegal attempts are non-fatal no-ops.
    pub fn transition(
        &mut self,
        new_state: RecoveryState,
        reason: &str,
        data: Option<std::collections::HashMap<String, String>>,
    ) -> bool {
        if !self.current.legal_targets().contains(&new_state) {
            tracing::warn!(
                target: crate::logging::TRANSITION_TARGET,
                from = ?self.current,
                to = ?new_state,
                "rejected illegal transition"
            );
            return false;
        }

        let record = TransitionRecord {
            from: self.current,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.to_string(),
            data: data.unwrap_or_default(),
        };

        tracing::info!(
            target: crate::logging::TRANSITION_TARGET,
            from = ?record.from,
            to = ?record.to,
            reason = %record.reason,
            "state transition"
        );

        self.metrics.record_transition(&record);
        self.history.push(record);
        self.current = new_state;
        self.state_entered_at = Instant::now();

        true
    }

    /// Snapshots current state plus the stored original confreg and config
    /// backup. Checkpoints are append-only.
    pub fn create_checkpoint(
        &mut self,
        user_data: Option<std::collections::HashMap<String, String>>,
    ) -> usize {
        self.checkpoints.push(StateCheckpoint {
            state: self.current,
            wall_time: Local::now(),
            original_confreg: self.original_confreg.clone(),
            config_backup: self.config_backup.clone(),
            user_data: user_data.unwrap_or_default(),
        });
        self.checkpoints.len() - 1
    }

    pub fn checkpoints(&self) -> &[StateCheckpoint] {
        &self.checkpoints
    }

    /// Transitions to `Rollback` then restores the latest checkpoint (or
    /// `at_index`, if given). Returns false if no checkpoint exists, or if
    /// the transition to `Rollback` itself is illegal from the current
    /// state.
    pub fn rollback(&mut self, at_index: Option<usize>) -> bool {
        if self.checkpoints.is_empty() {
            return false;
        }

        if !self.transition(RecoveryState::Rollback, "rolling back to checkpoint", None) {
            return false;
        }

        let idx = at_index.unwrap_or(self.checkpoints.len() - 1);
        let checkpoint = match self.checkpoints.get(idx) {
            Some(c) => c.clone(),
            None => return false,
        };

        self.current = checkpoint.state;
        self.original_confreg = checkpoint.original_confreg.clone();
        self.config_backup = checkpoint.config_backup.clone();
        self.state_entered_at = Instant::now();

        true
    }

    pub fn enter_error_state(&mut self, reason: &str) -> bool {
        let mut data = std::collections::HashMap::new();
        data.insert("reason".to_string(), reason.to_string());
        self.transition(RecoveryState::Error, reason, Some(data))
    }

    pub fn set_original_confreg(&mut self, value: &str) {
        self.original_confreg = Some(value.to_string());
    }

    pub fn original_confreg(&self) -> Option<&str> {
        self.original_confreg.as_deref()
    }

    pub fn set_config_backup(&mut self, path: &str) {
        self.config_backup = Some(path.to_string());
    }

    pub fn config_backup(&self) -> Option<&str> {
        self.config_backup.as_deref()
    }

    /// Folds the history to compute total wall-clock time spent in `state`,
    /// including any still-open interval if `state` is the current state.
    pub fn time_in_state(&self, state: RecoveryState) -> std::time::Duration {
        let mut total = std::time::Duration::ZERO;
        let mut entry: Option<DateTime<Local>> = None;

        for t in &self.history {
            if t.to == state {
                entry = Some(t.timestamp);
            } else if let Some(e) = entry {
                if t.from == state {
                    if let Ok(d) = (t.timestamp - e).to_std() {
                        total += d;
                    }
                    entry = None;
                }
            }
        }

        if entry.is_some() && self.current == state {
            total += self.state_entered_at.elapsed();
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::Arc;

    fn machine() -> RecoveryStateMachine {
        RecoveryStateMachine::new(Arc::new(NoopMetrics))
    }

    #[test]
    fn illegal_transition_is_a_nonfatal_noop() {
        let mut m = machine();
        assert!(!m.transition(RecoveryState::PasswordReset, "skip ahead", None));
        assert_eq!(m.current(), RecoveryState::Initial);
        assert!(m.history().is_empty());
    }

    #[test]
    fn legal_transition_appends_exactly_one_record() {
        let mut m = machine();
        assert!(m.transition(RecoveryState::Connected, "connecting", None));
        assert_eq!(m.history().len(), 1);
        assert_eq!(m.history()[0].from, RecoveryState::Initial);
        assert_eq!(m.history()[0].to, RecoveryState::Connected);
    }

    #[test]
    fn error_is_not_terminal_but_complete_is() {
        assert!(!RecoveryState::Error.is_terminal());
        assert!(RecoveryState::Complete.is_terminal());
        assert!(RecoveryState::Error.legal_targets().contains(&RecoveryState::Rollback));
        assert!(RecoveryState::Error.legal_targets().contains(&RecoveryState::Initial));
    }

    #[test]
    fn rollback_without_checkpoint_fails() {
        let mut m = machine();
        assert!(!m.rollback(None));
    }

    #[test]
    fn rollback_restores_latest_checkpoint() {
        let mut m = machine();
        m.transition(RecoveryState::Connected, "c", None);
        m.transition(RecoveryState::WaitingBoot, "w", None);
        m.set_original_confreg("0x2102");
        m.create_checkpoint(None);
        m.transition(RecoveryState::SendingBreak, "b", None);
        m.enter_error_state("boom");
        assert!(m.rollback(None));
        assert_eq!(m.current(), RecoveryState::WaitingBoot);
        assert_eq!(m.original_confreg(), Some("0x2102"));
    }

    #[test]
    fn sending_break_may_self_loop() {
        let mut m = machine();
        m.transition(RecoveryState::Connected, "c", None);
        m.transition(RecoveryState::WaitingBoot, "w", None);
        m.transition(RecoveryState::SendingBreak, "b", None);
        assert!(m.transition(RecoveryState::SendingBreak, "retry break", None));
    }
}

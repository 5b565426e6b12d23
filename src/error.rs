//! Crate-wide error kinds and their user-facing remediation hints.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::diag::DiagnosableError;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("serial port not found: {0}")]
    PortNotFound(String),

    #[error("permission denied opening {0}")]
    PortPermissionDenied(String),

    #[error("serial port busy: {0}")]
    PortBusy(String),

    #[error("serial port I/O error on {path}: {source}")]
    PortIO {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to {0} failed")]
    WriteFailed(String),

    #[error("operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("command rejected by device: {0}")]
    CommandSyntax(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("could not classify console output into a known prompt")]
    PromptUnknown,

    #[error("interrupted by user")]
    InterruptedByUser,

    #[error("failed to write {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecoveryError {
    /// Whether a retry layer should never retry this kind, regardless of
    /// attempts remaining.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RecoveryError::CommandSyntax(_))
    }
}

impl DiagnosableError for RecoveryError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            RecoveryError::PortNotFound(dev) => vec![
                format!("No device node found at {}.", dev),
                "Check the cable and run with --auto-detect to list candidate ports.".into(),
            ],
            RecoveryError::PortPermissionDenied(dev) => vec![
                format!("The current user cannot open {}.", dev),
                "Add your user to the dialout (or equivalent) group and re-login.".into(),
            ],
            RecoveryError::PortBusy(dev) => vec![
                format!("{} is already in use by another process.", dev),
                "Close any other terminal program (minicom, screen, picocom) holding the port."
                    .into(),
            ],
            RecoveryError::Timeout { operation, .. } => vec![
                format!("No expected prompt arrived for '{}'.", operation),
                "Power-cycle the router and retry.".into(),
            ],
            RecoveryError::VerificationFailed(_) => {
                vec!["Re-run the affected step; the router may need another attempt.".into()]
            }
            _ => vec![],
        }
    }
}

pub fn render(e: &RecoveryError) {
    crate::log::err(format!("{}", e));
    for hint in e.diagnose() {
        crate::log::hint(hint);
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

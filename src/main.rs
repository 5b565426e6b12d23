//! CLI & Orchestration (C11, ambient). Parses `Opts`, installs logging, opens
//! the transport, wires C2-C9 together, and drives either `--detect-only`
//! inventory or the full password-reset workflow. Structurally the same
//! shape as the teacher's `main()`/`main_try()` split, with a `ctrlc`-driven
//! interrupt handler mapped to exit code 130.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use structopt::StructOpt;

use cisco_recovery::backup::ConfigBackup;
use cisco_recovery::cli::Opts;
use cisco_recovery::error::{self, RecoveryError, Result};
use cisco_recovery::executor::CommandExecutor;
use cisco_recovery::inventory::SystemDetector;
use cisco_recovery::log;
use cisco_recovery::logging;
use cisco_recovery::metrics::{Metrics, MetricsSink};
use cisco_recovery::password_reset::{PasswordReset, StdinPasswordSource};
use cisco_recovery::rommon::RommonDriver;
use cisco_recovery::state_machine::{RecoveryState, RecoveryStateMachine};
use cisco_recovery::transport::{self, SerialTransport};

fn main() {
    match checked_run() {
        Ok(()) => std::process::exit(0),
        Err(RecoveryError::InterruptedByUser) => std::process::exit(130),
        Err(e) => {
            error::render(&e);
            std::process::exit(1);
        }
    }
}

/// Shared with the ctrlc handler: set to true on SIGINT, polled between
/// workflow steps so teardown still runs (closing the port, joining the
/// reader) before the process exits with code 130.
struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    fn check(&self) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Err(RecoveryError::InterruptedByUser)
        } else {
            Ok(())
        }
    }
}

/// Runs `body` while a background thread overwrites one status line with an
/// elapsed-time ticker via `log::cont_status`; stopped before `body`'s
/// result is returned. No-op display-wise when `quiet`.
fn with_ticker<T>(label: &str, quiet: bool, body: impl FnOnce() -> T) -> T {
    if quiet {
        return body();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ticker_stop = stop.clone();
    let ticker_label = label.to_string();
    let ticker = std::thread::spawn(move || {
        let start = std::time::Instant::now();
        while !ticker_stop.load(Ordering::SeqCst) {
            log::cont_status("Recovery", format!("{} ({}s elapsed)", ticker_label, start.elapsed().as_secs()));
            std::thread::sleep(Duration::from_millis(500));
        }
    });

    let result = body();
    stop.store(true, Ordering::SeqCst);
    let _ = ticker.join();
    result
}

fn checked_run() -> Result<()> {
    let opts = Opts::from_args();

    let _log_guards = logging::init(&opts.log_dir, &opts.log_level)
        .map_err(RecoveryError::Other)?;

    let quiet = opts.no_tui;
    let note = |msg: String| {
        if !quiet {
            log::status("Recovery", msg);
        }
    };

    let port = resolve_port(&opts)?;
    note(format!("Using serial port {} at {} baud", port, opts.baud));

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupted.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .map_err(|e| RecoveryError::Other(anyhow::anyhow!("failed to install SIGINT handler: {}", e)))?;
    let interrupt = Interrupt(interrupted);

    let metrics = Arc::new(Metrics::new());
    let metrics_sink: Arc<dyn MetricsSink> = metrics.clone();

    let mut transport = SerialTransport::new(metrics_sink.clone());
    transport.open(&port, opts.baud)?;
    let transport = Arc::new(Mutex::new(transport));

    let state_machine = Arc::new(Mutex::new(RecoveryStateMachine::new(metrics_sink.clone())));
    state_machine
        .lock()
        .unwrap()
        .transition(RecoveryState::Connected, "serial port opened", None);

    let executor = CommandExecutor::new(transport.clone(), metrics_sink.clone());

    let backup = if opts.no_backup {
        None
    } else {
        Some(ConfigBackup::new(&opts.backup_dir)?)
    };

    let result = if opts.detect_only {
        run_detect_only(&opts, &executor, &note)
    } else {
        run_recovery_workflow(
            &opts,
            &transport,
            &state_machine,
            &executor,
            metrics_sink.clone(),
            backup.as_ref(),
            &interrupt,
            &note,
        )
    };

    if opts.export_metrics {
        if let Err(e) = export_metrics(&opts, &metrics) {
            log::warn(format!("failed to export metrics snapshot: {}", e));
        }
    }

    // Teardown always runs, success or failure: close the port and join the
    // reader before the process decides its exit code.
    transport.lock().unwrap().close();

    result
}

fn resolve_port(opts: &Opts) -> Result<String> {
    if let Some(port) = &opts.port {
        return Ok(port.clone());
    }

    if opts.auto_detect {
        let candidates = transport::detect_ports();
        return candidates.into_iter().next().ok_or_else(|| {
            RecoveryError::PortNotFound("no candidate serial ports found by auto-detect".into())
        });
    }

    Err(RecoveryError::Other(anyhow::anyhow!(
        "no serial port given: pass --port <path> or --auto-detect"
    )))
}

fn run_detect_only(
    opts: &Opts,
    executor: &CommandExecutor,
    note: &dyn Fn(String),
) -> Result<()> {
    note("Running system inventory detection".to_string());
    let mut detector = SystemDetector::new(executor);
    detector.detect_all();

    let path = detector
        .export_results(&opts.export_dir, &opts.export_format)
        .map_err(RecoveryError::Other)?;
    log::success(format!("Inventory exported to {}", path.display()));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_recovery_workflow(
    opts: &Opts,
    transport: &Arc<Mutex<SerialTransport>>,
    state_machine: &Arc<Mutex<RecoveryStateMachine>>,
    executor: &CommandExecutor,
    metrics_sink: Arc<dyn MetricsSink>,
    backup: Option<&ConfigBackup>,
    interrupt: &Interrupt,
    note: &dyn Fn(String),
) -> Result<()> {
    let rommon = RommonDriver::new(transport.clone(), state_machine.clone(), metrics_sink);

    interrupt.check()?;
    note("Waiting for the router to enter its boot sequence".to_string());
    let entered_rommon = with_ticker("Waiting for ROM monitor", opts.no_tui, || {
        rommon.enter_rommon(Duration::from_secs(60), Duration::from_secs(60))
    });
    if !entered_rommon {
        state_machine
            .lock()
            .unwrap()
            .enter_error_state("failed to enter ROM monitor after break sequence");
        return Err(RecoveryError::Timeout {
            operation: "enter_rommon".to_string(),
            after: Duration::from_secs(60),
        });
    }
    note("ROM monitor entered".to_string());

    interrupt.check()?;
    if let Some(original) = query_confreg(transport) {
        state_machine.lock().unwrap().set_original_confreg(&original);
        if let Some(backup) = backup {
            if let Ok(path) = backup.backup_config_register(&original) {
                state_machine
                    .lock()
                    .unwrap()
                    .set_config_backup(&path.display().to_string());
            }
        }
    }
    state_machine.lock().unwrap().create_checkpoint(None);

    note("Setting configuration register to skip startup config".to_string());
    if !rommon.set_config_register("0x2142") {
        state_machine
            .lock()
            .unwrap()
            .enter_error_state("failed to set configuration register");
        return Err(RecoveryError::VerificationFailed(
            "configuration register change was not confirmed".to_string(),
        ));
    }

    interrupt.check()?;
    rommon.reboot_router();

    note("Waiting for IOS to boot without the startup configuration".to_string());
    let ios_booted = with_ticker("Waiting for IOS boot", opts.no_tui, || {
        rommon.wait_for_ios_boot(Duration::from_secs(120))
    });
    if !ios_booted {
        state_machine
            .lock()
            .unwrap()
            .enter_error_state("IOS did not boot within timeout");
        return Err(RecoveryError::Timeout {
            operation: "wait_for_ios_boot".to_string(),
            after: Duration::from_secs(120),
        });
    }

    interrupt.check()?;
    state_machine
        .lock()
        .unwrap()
        .transition(RecoveryState::SystemDetection, "running system inventory", None);
    note("Running system inventory".to_string());
    let mut detector = SystemDetector::new(executor);
    detector.detect_all();
    if let Ok(path) = detector.export_results(&opts.export_dir, &opts.export_format) {
        note(format!("Inventory exported to {}", path.display()));
    }

    interrupt.check()?;
    let interactive = opts.enable_secret.is_none() && !opts.no_tui;
    let source = StdinPasswordSource;
    let reset = PasswordReset::new(executor, state_machine, &source, interactive);

    note("Resetting enable secret, console, and VTY passwords".to_string());
    let completed = reset.complete_password_reset(
        opts.enable_secret.clone(),
        opts.console_password.clone(),
        opts.vty_password.clone(),
    );

    if !completed {
        state_machine
            .lock()
            .unwrap()
            .enter_error_state("password reset workflow did not complete");
        return Err(RecoveryError::VerificationFailed(
            "password reset workflow did not complete".to_string(),
        ));
    }

    interrupt.check()?;
    if let Some(backup) = backup {
        let (success, running_config) =
            executor.execute("show running-config", None, Duration::from_secs(30), true, true);
        if success {
            let _ = backup.backup_running_config(&running_config, "running");
        }
    }

    log::success("Password reset complete; router is running with the new enable secret".to_string());
    Ok(())
}

/// Queries the current configuration register directly over the transport
/// (the ROM monitor has no command-executor prompt detection loop of its
/// own beyond what `RommonDriver` already runs internally for `confreg`).
fn query_confreg(transport: &Arc<Mutex<SerialTransport>>) -> Option<String> {
    {
        let mut t = transport.lock().unwrap();
        let _ = t.write("confreg");
    }
    std::thread::sleep(Duration::from_secs(1));
    let output = {
        let t = transport.lock().unwrap();
        t.read_output(Duration::from_secs(5))
    };
    let pattern = Regex::new(r"(?i)0x[0-9a-f]{4}").ok()?;
    pattern.find(&output).map(|m| m.as_str().to_string())
}

fn export_metrics(opts: &Opts, metrics: &Metrics) -> anyhow::Result<PathBuf> {
    let snapshot = metrics.snapshot();
    std::fs::create_dir_all(&opts.log_dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let path = opts.log_dir.join(format!("metrics_{}.json", timestamp));
    std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
    Ok(path)
}

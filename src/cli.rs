//! CLI surface (C11, ambient). A `structopt`-derived `Opts`, the teacher's
//! own CLI derive of choice, standing in for the out-of-scope on-disk
//! settings store's in-scope subset (the flags that affect the core engine).

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "cisco-recovery",
    about = "Serial-driven Cisco ISR password-reset and recovery engine"
)]
pub struct Opts {
    /// Explicit TTY device, e.g. /dev/ttyUSB0. Required unless --auto-detect
    /// is given.
    #[structopt(long = "port")]
    pub port: Option<String>,

    /// Serial baud rate.
    #[structopt(long = "baud", default_value = "9600")]
    pub baud: u32,

    /// Scan /dev for candidate serial ports and use the first one found.
    #[structopt(long = "auto-detect")]
    pub auto_detect: bool,

    /// Run system inventory detection only (no ROM-monitor recovery or
    /// password reset) and exit.
    #[structopt(long = "detect-only")]
    pub detect_only: bool,

    /// DEBUG, INFO, WARNING, or ERROR.
    #[structopt(long = "log-level", default_value = "INFO")]
    pub log_level: String,

    /// Disable the interactive console status output; script mode.
    #[structopt(long = "no-tui")]
    pub no_tui: bool,

    /// Directory for config-backup snapshots (C9).
    #[structopt(long = "backup-dir", parse(from_os_str), default_value = "./backups")]
    pub backup_dir: PathBuf,

    /// Directory for structured log output (C10).
    #[structopt(long = "log-dir", parse(from_os_str), default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Directory for inventory export artifacts.
    #[structopt(long = "export-dir", parse(from_os_str), default_value = "./detections")]
    pub export_dir: PathBuf,

    /// Format for the inventory export produced under --detect-only.
    #[structopt(long = "export-format", default_value = "json")]
    pub export_format: String,

    /// New enable secret. Supplied non-interactively; if absent and
    /// --no-tui is not given, prompted for (with confirmation).
    #[structopt(long = "enable-secret")]
    pub enable_secret: Option<String>,

    /// New console line password. Optional; skipped if omitted.
    #[structopt(long = "console-password")]
    pub console_password: Option<String>,

    /// New VTY line password. Optional; skipped if omitted.
    #[structopt(long = "vty-password")]
    pub vty_password: Option<String>,

    /// Skip writing config-register/running-config backups before the
    /// recovery sequence starts.
    #[structopt(long = "no-backup")]
    pub no_backup: bool,

    /// Export a metrics_YYYYMMDD_HHMMSS.json snapshot after the run.
    #[structopt(long = "export-metrics")]
    pub export_metrics: bool,
}

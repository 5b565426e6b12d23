//! File-backed structured logging: daily-rotating text and JSON-lines output,
//! plus narrower command and state-transition logs filtered by event target.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Events tagged with this target land in the command log.
pub const COMMAND_TARGET: &str = "cisco_recovery::command";
/// Events tagged with this target land in the state-transition log.
pub const TRANSITION_TARGET: &str = "cisco_recovery::transition";

/// Guards returned by the non-blocking appenders; dropping these stops
/// delivery, so `main` must keep them alive for the process lifetime.
pub struct LogGuards {
    _text: WorkerGuard,
    _json: WorkerGuard,
    _commands: WorkerGuard,
    _transitions: WorkerGuard,
}

/// Installs the global tracing subscriber. `log_dir` is created if absent.
/// `level` is one of DEBUG/INFO/WARNING/ERROR (case-insensitive); unrecognized
/// values fall back to INFO.
pub fn init(log_dir: &Path, level: &str) -> anyhow::Result<LogGuards> {
    std::fs::create_dir_all(log_dir)?;

    // `EnvFilter` is attached per-layer (text/json only), not globally: the
    // command and transition logs are fed by `trace!`-level events tagged
    // with their own target, and must stay reachable regardless of the
    // configured default level - a global `info` filter would silently
    // drop every successful-command trace before it reached those layers.
    let text_appender = rolling::daily(log_dir, "recovery.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_appender);
    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(env_filter(level));

    let json_appender = rolling::daily(log_dir, "recovery.jsonl");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_ansi(false)
        .with_filter(env_filter(level));

    let command_appender = rolling::daily(log_dir, "commands.log");
    let (command_writer, command_guard) = tracing_appender::non_blocking(command_appender);
    let command_layer = fmt::layer()
        .with_writer(command_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target(COMMAND_TARGET, tracing::Level::TRACE));

    let transition_appender = rolling::daily(log_dir, "transitions.log");
    let (transition_writer, transition_guard) = tracing_appender::non_blocking(transition_appender);
    let transition_layer = fmt::layer()
        .with_writer(transition_writer)
        .with_ansi(false)
        .with_filter(Targets::new().with_target(TRANSITION_TARGET, tracing::Level::TRACE));

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(command_layer)
        .with(transition_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    Ok(LogGuards {
        _text: text_guard,
        _json: json_guard,
        _commands: command_guard,
        _transitions: transition_guard,
    })
}

fn env_filter(level: &str) -> EnvFilter {
    let level = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

//! Structured logging utilities for pollnet components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use pollnet_config::{log_reactor_debug, log_socket_warn};
//!
//! log_reactor_debug!(active = 12, "Commit finished");
//! log_socket_warn!(id = 3, error = %err, "Fatal socket error");
//! ```
//!
//! The macros accept the full `tracing` field syntax and expand to
//! `tracing` events, so the calling crate must depend on `tracing`.

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const REACTOR: &'static str = "REACTOR";
    pub const SOCKET: &'static str = "SOCKET";
    pub const TIMER: &'static str = "TIMER";
    pub const ECHO: &'static str = "ECHO";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === REACTOR logging macros ===

#[macro_export]
macro_rules! log_reactor_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "REACTOR", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_reactor_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "REACTOR", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_reactor_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = "REACTOR", $($arg)+)
    };
}

// === SOCKET logging macros ===

#[macro_export]
macro_rules! log_socket_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "SOCKET", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_socket_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "SOCKET", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_socket_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = "SOCKET", $($arg)+)
    };
}

// === TIMER logging macros ===

#[macro_export]
macro_rules! log_timer_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "TIMER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_timer_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = "TIMER", $($arg)+)
    };
}

// === ECHO logging macros ===

#[macro_export]
macro_rules! log_echo_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "ECHO", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_echo_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "ECHO", $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

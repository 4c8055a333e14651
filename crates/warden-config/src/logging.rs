//! Structured logging utilities for warden components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use warden_config::logging::*;
//!
//! log_tracker_info!("Tracking root process", pid = 100);
//! log_queue_debug!("Queue allocated", client_pid = 42);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const TRACKER: &'static str = "TRACKER";
    pub const QUEUE: &'static str = "QUEUE";
    pub const CORE: &'static str = "CORE";
    pub const MONITOR: &'static str = "MONITOR";
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

// === TRACKER logging macros ===

#[macro_export]
macro_rules! log_tracker_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tracker_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tracker_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

// === QUEUE logging macros ===

#[macro_export]
macro_rules! log_queue_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_queue_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

// === CORE logging macros ===

#[macro_export]
macro_rules! log_core_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_core_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CORE", $($key = $value,)* $msg)
    };
}

// === MONITOR logging macros ===

#[macro_export]
macro_rules! log_monitor_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "MONITOR", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_monitor_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MONITOR", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

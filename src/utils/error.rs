use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the build inputs.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Represents a failure of the underlying configuration source.
    ///
    /// This occurs when the environment cannot be read or a value has the wrong type.
    #[error("Configuration error: {0}")]
    Source(String),

    /// Indicates that a loaded value is out of range or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Source(err.to_string())
    }
}

/// Errors produced by the serial device layer.
///
/// None of these are fatal: the reader turns them into sentinel broadcasts
/// and retries.
#[derive(Error, Debug)]
pub enum ScaleError {
    /// The serial port could not be opened or configured.
    #[error("Failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// Represents an I/O failure on an open port.
    #[error("Serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the log manager.
#[derive(Error, Debug)]
pub enum LogError {
    /// No log file is backing the manager (console mode).
    #[error("log path not configured")]
    NotConfigured,

    /// Represents a filesystem failure while rotating, flushing or reopening.
    #[error("Log file error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while preparing the embedded web assets.
#[derive(Error, Debug)]
pub enum AssetError {
    /// The dashboard template does not carry the token placeholder.
    #[error("Dashboard template is missing the {0} placeholder")]
    MissingPlaceholder(&'static str),

    /// An embedded page is empty.
    #[error("Embedded asset {0} is empty")]
    Empty(&'static str),
}

/// Errors surfaced by the service lifecycle.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// A lifecycle phase was invoked out of order.
    ///
    /// This happens when `start` runs before `init`, or `stop` before `start`.
    #[error("Lifecycle error: {0}")]
    Lifecycle(&'static str),

    /// The embedded dashboard could not be prepared; the service cannot run without it.
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    /// The metrics registry rejected a collector.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Represents a failure of the HTTP listener.
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Represents an error in the build inputs.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

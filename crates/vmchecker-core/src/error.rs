//! Error taxonomy for the guest test executor.

use std::path::PathBuf;

/// Errors raised by the virtualization control plane and guest session.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("cannot connect to virtualization host: {0}")]
    Connection(String),

    #[error("guest descriptor not found: {}", .0.display())]
    DescriptorNotFound(PathBuf),

    #[error("cannot register guest descriptor: {0}")]
    Registration(String),

    #[error("snapshot index {index} out of range ({count} snapshot(s) stored)")]
    Snapshot { index: usize, count: usize },

    #[error("guest has no stored snapshots to revert to")]
    NoSnapshots,

    #[error("cannot power on guest: {0}")]
    PowerOn(String),

    #[error("guest tools not ready after {secs}s")]
    ToolsTimeout { secs: u64 },

    #[error("guest rejected credentials for user {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("file transfer failed ({from} -> {to}): {reason}")]
    Transfer {
        from: String,
        to: String,
        reason: String,
    },

    #[error("guest command failed: {0}")]
    Command(String),

    #[error("teardown step failed: {0}")]
    Teardown(String),

    #[error("guest directory {0:?} must end with a guest path separator")]
    InvalidGuestPath(String),

    #[error("invalid guest file name {0:?}")]
    InvalidGuestFileName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while loading course and submission configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("config section [{0}] not found")]
    MissingSection(String),

    #[error("config key {key} missing from section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("config key {key} in section [{section}] has invalid value {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Top-level executor errors. Every variant here ends the run with a
/// non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("bundle {} is missing required file(s): {}", bundle.display(), missing.join(", "))]
    MissingBundleFiles {
        bundle: PathBuf,
        missing: Vec<String>,
    },

    #[error("no guest descriptor (*.vmx) configured or found under {}", .0.display())]
    DescriptorUnresolved(PathBuf),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("guest error: {0}")]
    Guest(#[from] GuestError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for guest session operations.
pub type GuestResult<T> = std::result::Result<T, GuestError>;

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

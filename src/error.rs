//! Devtrace Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.
//!
//! Only resource acquisition during session start surfaces as a hard error.
//! Everything after a session is running (malformed telemetry, sink failures,
//! relay hiccups) is logged and absorbed by the subsystem that observed it.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for devtrace
#[derive(Error, Debug)]
pub enum DevtraceError {
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to allocate pseudo-terminal: {reason}")]
    TerminalAllocation { reason: String },

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed to create event transport: {0}")]
    TransportCreate(#[source] TransportError),

    #[error("PTY resize failed: {reason}")]
    Resize { reason: String },

    #[error("Failed to start {activity} thread: {source}")]
    Thread {
        activity: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport '{path}' already exists")]
    Collision { path: PathBuf },

    #[error("Permission denied creating transport '{path}'")]
    PermissionDenied { path: PathBuf },

    #[error("Failed to create transport '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event sink hand-off errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink is closed")]
    Closed,
}

/// Event and session storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Session not found: {id}")]
    SessionNotFound { id: Uuid },

    #[error("Failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("Failed to write file '{path}': {reason}")]
    FileWriteFailed { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type alias for devtrace operations
pub type Result<T> = std::result::Result<T, DevtraceError>;

/// Result type alias for bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

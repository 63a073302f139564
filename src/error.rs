use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Broad error category, stable across the IPC boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Capacity,
    QueueTimeout,
    Shutdown,
    Connection,
    Transfer,
    Integrity,
    Io,
    Config,
    Unsupported,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection pool for {server_key} is at capacity ({max} sessions)")]
    CapacityExceeded { server_key: String, max: usize },

    #[error("timed out after {waited:?} waiting for a session to {server_key}")]
    QueueTimeout { server_key: String, waited: Duration },

    #[error("connection pool is shut down")]
    PoolShutdown,

    #[error("failed to connect to {server_key}: {source}")]
    Connection {
        server_key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} failed: {source}")]
    Transfer {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// `interrupted` is set when the transport reported a failure, even if
    /// the byte count happens to match.
    #[error(
        "integrity check failed for {path}: expected {expected} bytes, got {actual}{}",
        interrupted_note(.interrupted)
    )]
    Integrity {
        path: String,
        expected: u64,
        actual: u64,
        interrupted: bool,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl EngineError {
    pub fn transfer(operation: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transfer {
            operation: operation.into(),
            source,
        }
    }

    pub fn connection(server_key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Connection {
            server_key: server_key.into(),
            source,
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::Capacity,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::PoolShutdown => ErrorKind::Shutdown,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Integrity failures must never be absorbed by a fallback path.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::PoolShutdown)
    }
}

fn interrupted_note(interrupted: &bool) -> &'static str {
    if *interrupted {
        " from an aborted transfer"
    } else {
        ""
    }
}

/// Normalized outcome of a public operation: success flag, a human-readable
/// message and, on success, the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            kind: None,
            data: Some(data),
        }
    }

    pub fn failed(err: &EngineError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            kind: Some(err.kind()),
            data: None,
        }
    }

    pub fn from_result(result: EngineResult<T>, success_message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(data, success_message),
            Err(e) => Self::failed(&e),
        }
    }
}

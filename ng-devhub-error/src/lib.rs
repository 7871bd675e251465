use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};

pub type HubResult<T, E = HubError> = anyhow::Result<T, E>;

/// Error taxonomy of the driver hub.
///
/// Every variant carries owned, cloneable data so that a single loader failure
/// can be handed to all callers coalesced on the same cache key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),
    #[error("driver load failed: {0}")]
    DriverLoad(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("mailbox full for {address} (capacity {capacity})")]
    QueueFull { address: String, capacity: usize },
    #[error("executor stopped: {0}")]
    ExecutorStopped(String),
    #[error("malformed report: {0}")]
    MalformedReport(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("{0}")]
    Json(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Msg(String),
}

impl HubError {
    #[inline]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        HubError::NotFound(what.to_string())
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::NotFound(_))
    }

    /// Wire error code carried by protocol error replies and platform error responses.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "request.destination.notfound",
            HubError::UnsupportedAddress(_) => "request.destination.unsupported",
            HubError::DriverLoad(_) => "driver.load",
            HubError::Timeout(_) => "request.timeout",
            HubError::QueueFull { .. } => "request.rejected",
            HubError::ExecutorStopped(_) => "driver.stopped",
            HubError::MalformedReport(_) => "request.param.invalid",
            HubError::InvalidState(_) => "request.state.invalid",
            HubError::Storage(_) => "storage.error",
            HubError::Bus(_) => "bus.error",
            HubError::Codec(_) | HubError::Json(_) => "request.param.invalid",
            HubError::Config(_) => "config.error",
            HubError::Io(_) | HubError::Msg(_) => "error",
        }
    }
}

impl From<SerdeJsonError> for HubError {
    #[inline]
    fn from(e: SerdeJsonError) -> Self {
        HubError::Json(e.to_string())
    }
}

impl From<ConfigError> for HubError {
    #[inline]
    fn from(e: ConfigError) -> Self {
        HubError::Config(e.to_string())
    }
}

impl From<IoError> for HubError {
    #[inline]
    fn from(e: IoError) -> Self {
        HubError::Io(e.to_string())
    }
}

impl From<JoinError> for HubError {
    #[inline]
    fn from(e: JoinError) -> Self {
        HubError::Msg(e.to_string())
    }
}

impl From<AnyhowError> for HubError {
    #[inline]
    fn from(e: AnyhowError) -> Self {
        HubError::Msg(e.to_string())
    }
}

impl From<String> for HubError {
    #[inline]
    fn from(e: String) -> Self {
        HubError::Msg(e)
    }
}

impl From<&str> for HubError {
    #[inline]
    fn from(e: &str) -> Self {
        HubError::Msg(e.to_string())
    }
}

impl From<&HubError> for HubError {
    #[inline]
    fn from(e: &HubError) -> Self {
        e.clone()
    }
}

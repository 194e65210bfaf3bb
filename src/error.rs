use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum HaError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer delivery failed; always transient from the core's point of view
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HaError {
    pub fn config(msg: impl Into<String>) -> Self {
        HaError::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        HaError::Transport(msg.into())
    }

    pub fn recovery(msg: impl Into<String>) -> Self {
        HaError::Recovery(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        HaError::Internal(msg.into())
    }
}

impl From<&str> for HaError {
    fn from(s: &str) -> Self {
        HaError::Internal(s.to_string())
    }
}

impl From<String> for HaError {
    fn from(s: String) -> Self {
        HaError::Internal(s)
    }
}

impl From<io::Error> for HaError {
    fn from(e: io::Error) -> Self {
        HaError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for HaError {
    fn from(e: serde_json::Error) -> Self {
        HaError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for HaError {
    fn from(e: serde_yaml::Error) -> Self {
        HaError::Yaml(e.to_string())
    }
}

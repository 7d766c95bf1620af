//!
//! src/errors.rs
//!
//! Error taxonomy for the bridge and conversions from the
//! libraries it talks through. Classification decides whether
//! a failure is retried, recorded on a single track, or aborts a run
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("authentication invalid: {0}")]
    AuthInvalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("task error: {0}")]
    Task(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl BridgeError {
    /// Worth another attempt after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::TransientNetwork(_))
    }

    /// Every later call in the same run would fail the same way
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::AuthInvalid(_) | BridgeError::Cancelled)
    }

    /// Maps an unsuccessful platform status code onto the taxonomy
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {}", truncate(body, 200))
        };
        match status.as_u16() {
            401 | 403 => BridgeError::AuthInvalid(detail),
            404 => BridgeError::NotFound(detail),
            429 => BridgeError::TransientNetwork(detail),
            s if s >= 500 => BridgeError::TransientNetwork(detail),
            _ => BridgeError::Rejected(detail)
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return BridgeError::from_status(status, "");
        }
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return BridgeError::TransientNetwork(e.to_string());
        }
        if e.is_decode() {
            return BridgeError::Parse(e.to_string());
        }
        BridgeError::Rejected(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self { BridgeError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self { BridgeError::Db(e.to_string()) }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(e: tokio::task::JoinError) -> Self { BridgeError::Task(e.to_string()) }
}

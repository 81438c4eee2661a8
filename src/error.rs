use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why a single page could not be turned into a raw record. Recorded per URL,
/// never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("disallowed by robots.txt")]
    Disallowed,
    #[error("run cancelled before the request was issued")]
    Cancelled,
}

impl FetchError {
    /// Short machine-readable class used in reports.
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Status(_) => "http-status",
            FetchError::Network(_) => "network",
            FetchError::Parse(_) => "parse",
            FetchError::Disallowed => "robots",
            FetchError::Cancelled => "cancelled",
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else if err.is_decode() || err.is_body() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Failures reading or writing store documents, backups and reports.
/// These abort the current stage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: {message}")]
    Shape { path: PathBuf, message: String },
    #[error("failed to back up {path}: {source}")]
    Backup { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_classes_are_stable() {
        assert_eq!(FetchError::Timeout.class(), "timeout");
        assert_eq!(FetchError::Status(503).class(), "http-status");
        assert_eq!(FetchError::Status(503).to_string(), "HTTP status 503");
        assert_eq!(FetchError::Disallowed.class(), "robots");
    }
}

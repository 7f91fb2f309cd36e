//! Error types for the cache store and the proxy workers

use std::io;

use reqwest::StatusCode;
use thiserror::Error;

use crate::events::FailureKind;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Cache index query failed: {0}")]
    Index(#[from] rusqlite::Error),
    #[error("Cache worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("No cache file name can be derived from {0}")]
    InvalidUrl(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Origin unreachable: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("Origin timed out")]
    Timeout,
    #[error("Origin answered {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("Origin stream starts at {actual}, expected {expected}")]
    UnexpectedRange { expected: u64, actual: u64 },
    #[error("Origin declared no content size for {0}")]
    UnknownSize(String),
    #[error("Origin stream failed: {0}")]
    Body(#[source] reqwest::Error),
    #[error("Origin request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Player connection closed: {0}")]
    ClientGone(#[source] io::Error),
    #[error("Request superseded")]
    Cancelled,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Proxy I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout
        } else if err.is_connect() {
            ProxyError::Connect(err)
        } else if err.is_body() || err.is_decode() {
            ProxyError::Body(err)
        } else {
            ProxyError::Request(err)
        }
    }

    /// Errors writing to the player socket. A reset there means the player
    /// dropped the connection, usually to seek or switch source.
    pub fn from_client_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProxyError::ClientGone(err),
            _ => ProxyError::Io(err),
        }
    }

    /// The class reported to the error sink, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ProxyError::Connect(_) => Some(FailureKind::NetworkUnavailable),
            ProxyError::Timeout => Some(FailureKind::Timeout),
            ProxyError::Status { .. } | ProxyError::UnexpectedRange { .. } => {
                Some(FailureKind::UrlInvalid)
            }
            _ => None,
        }
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, ProxyError::ClientGone(_) | ProxyError::Cancelled)
    }
}

//! Error types for replicadir

use crate::common::types::{ChunkId, LocationId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Directory Errors ===
    #[error("No such chunk: {0}")]
    NoSuchChunk(ChunkId),

    #[error("No such location: {0}")]
    NoSuchLocation(LocationId),

    #[error("No such medium: {0}")]
    NoSuchMedium(String),

    #[error("Location already registered: {0}")]
    LocationExists(LocationId),

    #[error("Invalid replication factor {requested}: must be within 1..={max}")]
    InvalidReplicationFactor { requested: u32, max: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Ground Store Errors ===
    #[error("Ground store unavailable: {0}")]
    GroundUnavailable(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Ground row corrupted: {0}")]
    GroundCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::GroundUnavailable(_)
                | Error::RocksDb(_)
        )
    }

    /// Is this a reference to something that no longer exists?
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Error::NoSuchChunk(_) | Error::NoSuchLocation(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NoSuchChunk(_) | Error::NoSuchLocation(_) | Error::NoSuchMedium(_) => {
                StatusCode::NOT_FOUND
            }
            Error::LocationExists(_) => StatusCode::CONFLICT,
            Error::InvalidReplicationFactor { .. }
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::GroundUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

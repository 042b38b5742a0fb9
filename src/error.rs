use thiserror::Error;

use crate::messages::{MessageId, RoomId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Malformed credential")]
    Malformed,
    #[error("Invalid credential signature")]
    BadSignature,
    #[error("Credential has been revoked")]
    Revoked,
    #[error("Credential has expired")]
    Expired,
    #[error("Failed to sign credential: {0}")]
    Signing(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Message content must not be empty")]
    EmptyContent,
    #[error("Message {0} not found")]
    MessageNotFound(MessageId),
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Write failed: {0}")]
    Write(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

/// Failures surfaced to the orchestration layer.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("Room {0} does not exist")]
    RoomNotFound(RoomId),
    #[error("Access to room {0} denied")]
    Forbidden(RoomId),
    #[error("Message {0} not found")]
    MessageNotFound(MessageId),
    #[error("Message {0} belongs to another user")]
    NotMessageOwner(MessageId),
    #[error("Invalid request: {0}")]
    InvalidInput(&'static str),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<StorageError> for HubError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MessageNotFound(id) => HubError::MessageNotFound(id),
            StorageError::RoomNotFound(id) => HubError::RoomNotFound(id),
            other => HubError::Storage(other),
        }
    }
}

impl warp::reject::Reject for HubError {}

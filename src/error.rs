use std::time::Duration;

use thiserror::Error;

/// Failures of the submissions store and the Redis-backed queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("A submission with this email already exists")]
    DuplicateKey,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match e {
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => StoreError::DuplicateKey,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<rocket_db_pools::deadpool_redis::redis::RedisError> for StoreError {
    fn from(e: rocket_db_pools::deadpool_redis::redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Why an email could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Email is not configured")]
    NotConfigured,

    #[error("Invalid address {0}")]
    Address(String),

    #[error("Failed to build message: {0}")]
    Message(String),

    #[error("Failed to send: {0}")]
    Transport(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

/// A realtime event that could not be turned into a submission.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Malformed event payload: {0}")]
    Payload(String),

    #[error("Feed connection failed: {0}")]
    Connection(String),
}

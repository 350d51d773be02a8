use thiserror::Error;

/// Everything that can go wrong while relaying one stream.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Start payload missing or unusable. Reported to the client.
    #[error("{0}")]
    Validation(String),

    /// Envelope that is not JSON or names an unknown type. Logged and dropped.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("transcoder input closed: {0}")]
    Write(#[source] std::io::Error),

    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the error leaves the session unable to continue.
    ///
    /// `StoreUnavailable` is only fatal while starting; teardown paths never
    /// propagate it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Write(_) | RelayError::StoreUnavailable(_) | RelayError::Connection(_)
        )
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

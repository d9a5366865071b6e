use thiserror::Error;

/// Error types for the dispatcher core.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema validation error: {0}")]
    SchemaCompile(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Duplicate registration for baseUUID {0}")]
    DuplicateRegistration(String),

    #[error("Missing related transaction: {0}")]
    MissingRelatedTransaction(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

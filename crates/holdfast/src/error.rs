//! Error types for lock acquisition, holding, and release

/// Error type for operations against the coordination service.
///
/// Both variants are the same caller-visible class (something between this
/// process and the service went wrong) and are always distinct from "the
/// lock is held by another owner".
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("coordination service error: {0}")]
    Service(String),
}

/// Error type for lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The key already exists: another holder owns the lock. Expected under
    /// contention, never retried internally. Carries the holder's stored
    /// value when the transaction's read branch returned one.
    #[error("lock is held by another owner")]
    NotAcquired { holder: Option<Vec<u8>> },

    /// The renewal stream ended while the lock was held: exclusivity can no
    /// longer be guaranteed.
    #[error("lock ownership lost before release")]
    Lost,

    /// TTL must be a positive number of seconds.
    #[error("invalid lease ttl: {0}s")]
    InvalidTtl(i64),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// The protected operation returned a failure of its own.
    #[error("critical section failed: {0}")]
    Body(#[source] anyhow::Error),

    /// The protected operation panicked; the panic was intercepted at the
    /// critical-section boundary so release still ran.
    #[error("critical section panicked: {0}")]
    BodyPanic(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

use thiserror::Error;

/// Errors surfaced by the saga engine and its log backends.
///
/// Every variant carries a human-readable description. Use [`fatal_err`] (or
/// [`SagaError::is_fatal`]) to decide whether a failed call may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    /// The requested transition is illegal given the saga's current state.
    #[error("Invalid saga state: {0}")]
    InvalidSagaState(String),

    /// The message itself is malformed (missing ids, misplaced task id).
    #[error("Invalid saga message: {0}")]
    InvalidSagaMessage(String),

    /// The log backend refused the request as structurally unacceptable.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The log backend failed to durably store or read a message.
    #[error("Internal log error: {0}")]
    InternalLog(String),

    /// Replaying the stored history produced an inconsistent state.
    #[error("Corrupted saga log: {0}")]
    CorruptedSagaLog(String),
}

impl SagaError {
    /// Returns true if retrying the identical call cannot succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            SagaError::InvalidSagaState(_) => true,
            SagaError::InvalidSagaMessage(_) => true,
            SagaError::InvalidRequest(_) => true,
            // transient: the message was not stored, retry is safe
            SagaError::InternalLog(_) => false,
            SagaError::CorruptedSagaLog(_) => true,
        }
    }
}

impl From<std::io::Error> for SagaError {
    fn from(err: std::io::Error) -> Self {
        SagaError::InternalLog(err.to_string())
    }
}

/// Classifies an error returned by a saga update.
///
/// Returns true if the error is fatal, false if it is transient and the
/// caller may reissue the same logical call.
pub fn fatal_err(err: &SagaError) -> bool {
    err.is_fatal()
}

pub type Result<T> = std::result::Result<T, SagaError>;

use crate::core::domain::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("invalid profile `{id}`: {reason}")]
    InvalidProfile { id: String, reason: String },
}

/// Failures that are reported to the caller instead of an `ExecutionResult`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("source is {size} bytes, the limit is {limit} bytes")]
    SourceTooLarge { size: usize, limit: usize },
    #[error("session `{0}` already has an execution in flight")]
    AlreadyRunning(SessionId),
    #[error("no execution slot became free within {waited_ms} ms")]
    Overloaded { waited_ms: u64 },
    #[error("execution was cancelled")]
    Cancelled,
}

impl From<RegistryError> for ExecuteError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnsupportedLanguage(id) => ExecuteError::UnsupportedLanguage(id),
            RegistryError::InvalidProfile { id, .. } => ExecuteError::UnsupportedLanguage(id),
        }
    }
}

//! Error taxonomies shared across the system.

/// Storage error taxonomy returned by every backend operation.
///
/// Callers retry on [`StorageErr::is_retriable`] errors (connection loss,
/// deadlock) and propagate everything else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageErr {
    #[error("storage connection error: {0}")]
    Connection(String),
    #[error("database not found: {0}")]
    DbNotFound(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("deadlock detected: {0}")]
    DeadLock(String),
    #[error("{0}")]
    Other(String),
}

impl StorageErr {
    /// Whether a caller should retry the operation on a fresh transaction.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageErr::Connection(_) | StorageErr::DeadLock(_))
    }
}

/// Failure codes reported by the task executor child over its result pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionInvokeError {
    Success = 0,
    WrongNumberOfArguments = 1,
    ArgumentParsingError = 2,
    ResultParsingError = 3,
    FunctionExecutionError = 4,
}

impl FunctionInvokeError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::WrongNumberOfArguments),
            2 => Some(Self::ArgumentParsingError),
            3 => Some(Self::ResultParsingError),
            4 => Some(Self::FunctionExecutionError),
            _ => None,
        }
    }
}

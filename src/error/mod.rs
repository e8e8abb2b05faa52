mod context;
mod exit_codes;

pub use context::{ErrorContext, format_error_chain};
pub use exit_codes::get_exit_code;

use thiserror::Error;

/// Reason an acquisition promise settled without granting the lock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRejection {
    #[error("lock request was canceled before it was granted")]
    Canceled,

    #[error("lock was invalidated while waiting")]
    Invalidated,
}

#[derive(Error, Debug)]
pub enum QuotaLockError {
    #[error("Invalid persistence type: {0}")]
    InvalidPersistenceType(String),

    #[error("Invalid client type: {0}")]
    InvalidClientType(String),

    #[error("Invalid origin scope: {0}")]
    InvalidOriginScope(String),

    #[error("Invalid lock category: {0}")]
    InvalidCategory(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Scenario error: {0}")]
    ScenarioError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QuotaLockError>;

use herald_core::{HeraldError, LifecycleState};
use herald_ledger::LedgerError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("notice not found")]
    NotFound,

    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("physical notification was never required")]
    PhysicalNotRequired,

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("document already registered")]
    AlreadyRegistered,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<HeraldError> for LifecycleError {
    fn from(e: HeraldError) -> Self {
        match e {
            HeraldError::NotFound(_) => LifecycleError::NotFound,
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}

impl From<LedgerError> for LifecycleError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(_) => LifecycleError::NotFound,
            LedgerError::AlreadyRegistered(_) => LifecycleError::AlreadyRegistered,
            LedgerError::Encoding(msg) | LedgerError::InvalidHash(msg) => {
                LifecycleError::InvalidDocument(msg)
            }
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

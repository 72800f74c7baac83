use herald_core::HeraldError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("document already registered: {0}")]
    AlreadyRegistered(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already signed: {0}")]
    AlreadySigned(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("canonical encoding error: {0}")]
    Encoding(String),

    #[error("signing key error: {0}")]
    Key(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Provider(_))
    }
}

impl From<HeraldError> for LedgerError {
    fn from(e: HeraldError) -> Self {
        match e {
            HeraldError::NotFound(what) => LedgerError::NotFound(what),
            HeraldError::Provider(msg) | HeraldError::ProviderTimeout(msg) => {
                LedgerError::Provider(msg)
            }
            HeraldError::Serialization(msg) => LedgerError::Encoding(msg),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

impl From<LedgerError> for HeraldError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(what) => HeraldError::NotFound(what),
            LedgerError::Provider(msg) => HeraldError::Provider(msg),
            other => HeraldError::Internal(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_herald_error() {
        let e: LedgerError = HeraldError::ProviderTimeout("tsa".into()).into();
        assert!(matches!(e, LedgerError::Provider(_)));
        assert!(e.is_retryable());
        let e: LedgerError = HeraldError::NotFound("notice/n-1".into()).into();
        assert!(matches!(e, LedgerError::NotFound(_)));
        assert!(!e.is_retryable());
    }
}

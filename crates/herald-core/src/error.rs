use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider timeout: {0}")]
    ProviderTimeout(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HeraldError {
    /// External calls that may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HeraldError::Provider(_) | HeraldError::ProviderTimeout(_) | HeraldError::Conflict(_)
        )
    }
}

impl From<serde_json::Error> for HeraldError {
    fn from(e: serde_json::Error) -> Self {
        HeraldError::Serialization(e.to_string())
    }
}

pub type HeraldResult<T> = Result<T, HeraldError>;

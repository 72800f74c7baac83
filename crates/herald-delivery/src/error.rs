use herald_core::HeraldError;
use thiserror::Error;

/// Error type for the delivery engine.
///
/// Messages can end up in provider acknowledgements, so they stay generic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed payload")]
    MalformedPayload,

    #[error("notice not found")]
    NotFound,

    #[error("notice is in a terminal state")]
    TerminalState,

    #[error("no provider configured for channel")]
    NoProvider,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("provider unavailable")]
    ProviderUnavailable,

    #[error("configuration error")]
    Configuration,

    #[error("internal error")]
    Internal,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::ProviderUnavailable | DeliveryError::CircuitOpen
        )
    }
}

impl From<HeraldError> for DeliveryError {
    fn from(e: HeraldError) -> Self {
        match e {
            HeraldError::NotFound(_) => DeliveryError::NotFound,
            HeraldError::Provider(_) | HeraldError::ProviderTimeout(_) => {
                DeliveryError::ProviderUnavailable
            }
            HeraldError::Serialization(_) => DeliveryError::MalformedPayload,
            other => {
                tracing::error!(error = %other, "delivery storage failure");
                DeliveryError::Internal
            }
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

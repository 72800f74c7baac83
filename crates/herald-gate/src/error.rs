use herald_core::{GateOutcome, HeraldError};
use thiserror::Error;

/// Error type for the gatekeeper.
///
/// Messages reach the accessor, so they never echo identifiers, codes or
/// answers. Detail stays in the gate log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("invalid input")]
    InvalidInput,

    #[error("credential mismatch")]
    CredentialMismatch,

    #[error("too many attempts, try again later")]
    LockedOut,

    #[error("invalid code")]
    CodeMismatch { remaining: u32 },

    #[error("code expired or not issued")]
    CodeExpired,

    #[error("code attempts exhausted, request a new code")]
    CodeExhausted,

    #[error("previous verification step not completed")]
    OutOfOrder,

    #[error("verification step not required")]
    NotRequired,

    #[error("biometric enrollment missing")]
    NotEnrolled,

    #[error("biometric enrollment already exists")]
    AlreadyEnrolled,

    #[error("biometric verification failed")]
    BiometricRejected,

    #[error("contingency not available")]
    ContingencyUnavailable,

    #[error("answer did not match")]
    ChallengeMismatch { remaining: u32 },

    #[error("challenge locked, contact the issuer")]
    ChallengeLocked,

    #[error("declaration not accepted")]
    DeclarationRequired,

    #[error("notice not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("provider unavailable")]
    ProviderUnavailable,

    #[error("internal error")]
    Internal,
}

impl GateError {
    /// Attempts exhausted: terminal for the current code, window or
    /// challenge until re-issuance or manual override.
    pub fn is_lockout(&self) -> bool {
        matches!(
            self,
            GateError::LockedOut | GateError::CodeExhausted | GateError::ChallengeLocked
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::ProviderUnavailable)
    }

    /// How the failed call is recorded in the gate log. `None` for failures
    /// that happen outside gate logic.
    pub fn outcome(&self) -> Option<GateOutcome> {
        match self {
            GateError::InvalidInput | GateError::NotFound => Some(GateOutcome::Invalid),
            GateError::CredentialMismatch
            | GateError::CodeMismatch { .. }
            | GateError::CodeExpired
            | GateError::BiometricRejected
            | GateError::ChallengeMismatch { .. }
            | GateError::DeclarationRequired => Some(GateOutcome::Failed),
            GateError::LockedOut | GateError::CodeExhausted | GateError::ChallengeLocked => {
                Some(GateOutcome::LockedOut)
            }
            GateError::OutOfOrder
            | GateError::NotRequired
            | GateError::NotEnrolled
            | GateError::AlreadyEnrolled
            | GateError::ContingencyUnavailable => Some(GateOutcome::OutOfOrder),
            GateError::ProviderUnavailable => Some(GateOutcome::ProviderError),
            GateError::Unauthorized | GateError::Internal => None,
        }
    }
}

impl From<HeraldError> for GateError {
    fn from(e: HeraldError) -> Self {
        match e {
            HeraldError::NotFound(_) => GateError::NotFound,
            HeraldError::Provider(_) | HeraldError::ProviderTimeout(_) => {
                GateError::ProviderUnavailable
            }
            other => {
                tracing::error!(error = %other, "gate storage failure");
                GateError::Internal
            }
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<GateError> {
        vec![
            GateError::InvalidInput,
            GateError::CredentialMismatch,
            GateError::LockedOut,
            GateError::CodeMismatch { remaining: 2 },
            GateError::CodeExpired,
            GateError::CodeExhausted,
            GateError::OutOfOrder,
            GateError::NotRequired,
            GateError::NotEnrolled,
            GateError::AlreadyEnrolled,
            GateError::BiometricRejected,
            GateError::ContingencyUnavailable,
            GateError::ChallengeMismatch { remaining: 1 },
            GateError::ChallengeLocked,
            GateError::DeclarationRequired,
            GateError::NotFound,
            GateError::Unauthorized,
            GateError::ProviderUnavailable,
            GateError::Internal,
        ]
    }

    #[test]
    fn test_error_display_messages_are_generic() {
        for err in all() {
            let msg = err.to_string();
            assert!(!msg.contains("secret"), "leaked: {msg}");
            assert!(!msg.chars().any(|c| c.is_ascii_digit()), "echoed a value: {msg}");
        }
    }

    #[test]
    fn test_lockout_classification() {
        let lockouts: Vec<_> = all().into_iter().filter(|e| e.is_lockout()).collect();
        assert_eq!(
            lockouts,
            vec![
                GateError::LockedOut,
                GateError::CodeExhausted,
                GateError::ChallengeLocked
            ]
        );
        assert!(lockouts
            .iter()
            .all(|e| e.outcome() == Some(GateOutcome::LockedOut)));
    }

    #[test]
    fn test_only_provider_failures_retry() {
        assert!(GateError::ProviderUnavailable.is_retryable());
        assert!(!GateError::CodeMismatch { remaining: 1 }.is_retryable());
        assert_eq!(
            GateError::ProviderUnavailable.outcome(),
            Some(GateOutcome::ProviderError)
        );
    }

    #[test]
    fn test_from_herald_error() {
        assert_eq!(
            GateError::from(HeraldError::NotFound("n-1".into())),
            GateError::NotFound
        );
        assert_eq!(
            GateError::from(HeraldError::ProviderTimeout("bio".into())),
            GateError::ProviderUnavailable
        );
        assert_eq!(
            GateError::from(HeraldError::Storage("locked".into())),
            GateError::Internal
        );
    }
}

use axum::http::StatusCode;
use thiserror::Error;

use herald_core::HeraldError;
use herald_delivery::DeliveryError;
use herald_gate::GateError;
use herald_ledger::LedgerError;
use herald_lifecycle::LifecycleError;

/// Error type for the herald binary, aggregating the component errors.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("storage error: {0}")]
    Core(#[from] HeraldError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

impl RootError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RootError::Gate(e) => gate_status(e),
            RootError::Delivery(e) => match e {
                DeliveryError::InvalidSignature => StatusCode::UNAUTHORIZED,
                DeliveryError::MalformedPayload => StatusCode::BAD_REQUEST,
                DeliveryError::NotFound => StatusCode::NOT_FOUND,
                DeliveryError::TerminalState => StatusCode::CONFLICT,
                DeliveryError::NoProvider | DeliveryError::Configuration => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                DeliveryError::CircuitOpen | DeliveryError::ProviderUnavailable => {
                    StatusCode::BAD_GATEWAY
                }
                DeliveryError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RootError::Ledger(e) => match e {
                LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::AlreadyRegistered(_) | LedgerError::AlreadySigned(_) => {
                    StatusCode::CONFLICT
                }
                LedgerError::InvalidHash(_) | LedgerError::Encoding(_) => StatusCode::BAD_REQUEST,
                LedgerError::Provider(_) => StatusCode::BAD_GATEWAY,
                LedgerError::Key(_) | LedgerError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            RootError::Lifecycle(e) => match e {
                LifecycleError::NotFound => StatusCode::NOT_FOUND,
                LifecycleError::InvalidTransition { .. }
                | LifecycleError::PhysicalNotRequired
                | LifecycleError::AlreadyRegistered => StatusCode::CONFLICT,
                LifecycleError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
                LifecycleError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RootError::Core(HeraldError::NotFound(_)) | RootError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RootError::Core(HeraldError::Provider(_) | HeraldError::ProviderTimeout(_)) => {
                StatusCode::BAD_GATEWAY
            }
            RootError::Core(HeraldError::Conflict(_)) => StatusCode::CONFLICT,
            RootError::Unauthorized => StatusCode::UNAUTHORIZED,
            RootError::Forbidden => StatusCode::FORBIDDEN,
            RootError::BadRequest(_) | RootError::Serialization(_) => StatusCode::BAD_REQUEST,
            RootError::Core(_) | RootError::Config(_) | RootError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to a caller. Storage and configuration detail
    /// stays in the logs.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => match self {
                RootError::Gate(e) => e.to_string(),
                RootError::Delivery(e) => e.to_string(),
                RootError::Lifecycle(LifecycleError::Storage(_)) => "internal error".to_string(),
                other => other.to_string(),
            },
        }
    }
}

fn gate_status(e: &GateError) -> StatusCode {
    match e {
        GateError::InvalidInput | GateError::DeclarationRequired => StatusCode::BAD_REQUEST,
        GateError::Unauthorized => StatusCode::UNAUTHORIZED,
        GateError::CredentialMismatch
        | GateError::CodeMismatch { .. }
        | GateError::BiometricRejected
        | GateError::ChallengeMismatch { .. } => StatusCode::FORBIDDEN,
        GateError::NotFound => StatusCode::NOT_FOUND,
        GateError::OutOfOrder
        | GateError::NotRequired
        | GateError::NotEnrolled
        | GateError::AlreadyEnrolled
        | GateError::ContingencyUnavailable => StatusCode::CONFLICT,
        GateError::CodeExpired => StatusCode::GONE,
        GateError::ChallengeLocked => StatusCode::LOCKED,
        GateError::LockedOut | GateError::CodeExhausted => StatusCode::TOO_MANY_REQUESTS,
        GateError::ProviderUnavailable => StatusCode::BAD_GATEWAY,
        GateError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type RootResult<T> = Result<T, RootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_error_display() {
        let err = RootError::Config("missing job secret".into());
        assert_eq!(err.to_string(), "configuration error: missing job secret");
    }

    #[test]
    fn test_gate_errors_map_to_taxonomy() {
        let cases = [
            (GateError::InvalidInput, StatusCode::BAD_REQUEST),
            (GateError::Unauthorized, StatusCode::UNAUTHORIZED),
            (GateError::OutOfOrder, StatusCode::CONFLICT),
            (GateError::CodeExpired, StatusCode::GONE),
            (GateError::ChallengeLocked, StatusCode::LOCKED),
            (GateError::LockedOut, StatusCode::TOO_MANY_REQUESTS),
            (GateError::ProviderUnavailable, StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(RootError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = RootError::Core(HeraldError::Storage("disk /var/lib full".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "internal error");

        let err = RootError::from(GateError::CodeMismatch { remaining: 2 });
        assert_eq!(err.public_message(), "invalid code");
    }

    #[test]
    fn test_from_toml_and_json() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        assert!(matches!(RootError::from(toml_err), RootError::Config(_)));
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            RootError::from(json_err),
            RootError::Serialization(_)
        ));
    }

    #[test]
    fn test_lifecycle_transition_conflict() {
        let err = RootError::from(LifecycleError::PhysicalNotRequired);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}

//! Gatekeeper Protocol
//!
//! Staged identity verification between dispatch and content reveal:
//! credential match, one-time code, optional biometrics with a contingency
//! path, and reading confirmation. [`Gatekeeper`] enforces the order and
//! logs every call with its access metadata.

pub mod access;
pub mod biometric;
pub mod comprehension;
pub mod credential;
pub mod error;
pub mod normalize;
pub mod otp;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

pub use access::{AccessClaims, AccessKey};
pub use biometric::{DeviceCapabilityReport, SIMILARITY_THRESHOLD};
pub use comprehension::{ChallengePrompt, DEFAULT_COMPREHENSION_ATTEMPTS};
pub use credential::{CREDENTIAL_MAX_FAILURES, CREDENTIAL_WINDOW_SECS};
pub use error::{GateError, GateResult};
pub use otp::{
    CodePolicy, IssuedCode, CODE_LENGTH, DEFAULT_CODE_TTL_SECS, MAX_CODE_ATTEMPTS, MIN_CODE_ATTEMPTS,
};
pub use protocol::{ContingencyTicket, GatePass, GatePolicy, GateProgress, GateStores, Gatekeeper};

//! Error types for Aegis identity operations.
//!
//! Hardware faults, verification rejections and certification RPC failures
//! are kept in separate enums so that each boundary can decide what is
//! retryable and what is terminal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the TPM key hierarchy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TpmError {
    /// Device is processing another command; retried with backoff.
    #[error("TPM device busy")]
    DeviceBusy,

    /// Device missing, worker gone, or the call timed out. Fatal for the round.
    #[error("TPM device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device returned something that does not parse. Never retried.
    #[error("malformed TPM response: {0}")]
    MalformedResponse(String),

    /// No enrolled Attestation Key yet (first boot).
    #[error("attestation key not ready")]
    AkNotReady,

    /// Public blob does not belong to a key resident in this TPM.
    #[error("unknown key: {0}")]
    UnknownKey(String),
}

impl TpmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TpmError::DeviceBusy)
    }
}

/// Terminal verifier rejections.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum VerificationError {
    #[error("replay detected: {0}")]
    ReplayDetected(String),

    #[error("certificate chain invalid: {0}")]
    ChainInvalid(String),

    #[error("quote invalid: {0}")]
    QuoteInvalid(String),

    #[error("measurement mismatch: {0}")]
    MeasurementMismatch(String),
}

impl VerificationError {
    /// Stable short code used in audit records and RPC bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VerificationError::ReplayDetected(_) => "ReplayDetected",
            VerificationError::ChainInvalid(_) => "ChainInvalid",
            VerificationError::QuoteInvalid(_) => "QuoteInvalid",
            VerificationError::MeasurementMismatch(_) => "MeasurementMismatch",
        }
    }
}

/// Delegated certification failures as seen by either side of the RPC.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificationError {
    /// Retryable until enrollment completes.
    #[error("AKNotReady")]
    AkNotReady,

    #[error("caller is not local: {0}")]
    NotLocal(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("device error: {0}")]
    Device(TpmError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TpmError> for CertificationError {
    fn from(err: TpmError) -> Self {
        match err {
            TpmError::AkNotReady => CertificationError::AkNotReady,
            TpmError::UnknownKey(detail) => CertificationError::BadRequest(detail),
            other => CertificationError::Device(other),
        }
    }
}

/// TPM wire codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StructureError {
    #[error("truncated structure: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unexpected tag: expected 0x{expected:04x}, found 0x{found:04x}")]
    UnexpectedTag { expected: u16, found: u16 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    #[error("field too large for TPM2B: {0} bytes")]
    TooLarge(usize),
}

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// TPM-related errors
    #[error("TPM error: {0}")]
    Tpm(#[from] TpmError),

    /// Verification rejections
    #[error("Verification rejected: {0}")]
    Verification(#[from] VerificationError),

    /// Certification RPC errors
    #[error("Certification error: {0}")]
    Certification(#[from] CertificationError),

    /// TPM structure encoding errors
    #[error("Structure error: {0}")]
    Structure(#[from] StructureError),

    /// Location claim could not be confirmed; degrades claims only
    #[error("Location unverified: {0}")]
    LocationUnverified(String),

    /// Certificate Authority errors
    #[error("CA error: {0}")]
    CertificateAuthority(String),

    /// Node not present in the registry
    #[error("Node not found: {node_uuid}")]
    NodeNotFound { node_uuid: String },

    /// Node already enrolled
    #[error("Node already exists: {node_uuid}")]
    NodeExists { node_uuid: String },

    /// Illegal lifecycle transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] aegis_core::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(TpmError::DeviceBusy.is_retryable());
        assert!(!TpmError::DeviceUnavailable("gone".into()).is_retryable());
        assert!(!TpmError::MalformedResponse("bad".into()).is_retryable());
        assert!(!TpmError::AkNotReady.is_retryable());
    }

    #[test]
    fn test_ak_not_ready_maps_through() {
        let err: CertificationError = TpmError::AkNotReady.into();
        assert_eq!(err, CertificationError::AkNotReady);
        assert_eq!(err.to_string(), "AKNotReady");
    }

    #[test]
    fn test_rejection_serializes_with_kind() {
        let err = VerificationError::ReplayDetected("nonce reused".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "ReplayDetected");
        assert_eq!(err.code(), "ReplayDetected");
    }
}
